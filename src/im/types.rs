//! 消息与推送体的数据结构、HTTP 响应通用处理

use crate::im::identity::ConversationType;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

/// 消息类型标识符
pub mod msg_type {
    pub const TEXT: i32 = 1;
    pub const IMAGE: i32 = 2;
    pub const VOICE: i32 = 3;
    pub const VIDEO: i32 = 4;
    pub const FILE: i32 = 5;
    pub const SYSTEM: i32 = 6;
}

/// 一条聊天消息
///
/// 推送通道和 REST 历史接口返回同一结构，区别在于 `created_at` 的表示：
/// 推送给 Unix 秒，REST 给 RFC3339 字符串，反序列化时统一为 Unix 秒。
/// 本地乐观写入的消息可能还没有服务端 `msg_id`。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(default)]
    pub msg_id: Option<String>,
    pub from_user_id: i64,
    pub conversation_id: i64,
    pub conversation_type: ConversationType,
    pub msg_type: i32,
    #[serde(default)]
    pub content: String,
    pub seq: i64,
    #[serde(default, deserialize_with = "deserialize_timestamp")]
    pub created_at: i64,
}

impl ChatMessage {
    /// 去重判据：优先比较 `msg_id`，任一方缺失时退回 `(seq, from_user_id)`
    pub fn same_message(&self, other: &ChatMessage) -> bool {
        if let (Some(a), Some(b)) = (&self.msg_id, &other.msg_id) {
            if a == b {
                return true;
            }
        }
        self.seq == other.seq && self.from_user_id == other.from_user_id
    }
}

/// 时间戳反序列化：兼容 Unix 秒（推送路径）和 RFC3339 字符串（REST 路径）
pub fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Unix(i64),
        Text(String),
    }

    match Repr::deserialize(deserializer)? {
        Repr::Unix(v) => Ok(v),
        Repr::Text(s) => chrono::DateTime::parse_from_rfc3339(&s)
            .map(|t| t.timestamp())
            .map_err(serde::de::Error::custom),
    }
}

/// Go `sql.NullString` 反序列化：兼容裸字符串、`{"String":..,"Valid":..}`、null
pub fn deserialize_null_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Plain(String),
        Wrapped {
            #[serde(rename = "String")]
            value: String,
            #[serde(rename = "Valid")]
            valid: bool,
        },
    }

    let repr: Option<Repr> = Option::deserialize(deserializer)?;
    Ok(match repr {
        Some(Repr::Plain(s)) => s,
        Some(Repr::Wrapped { value, valid }) => {
            if valid {
                value
            } else {
                String::new()
            }
        }
        None => String::new(),
    })
}

/// Go `sql.NullTime` 反序列化：兼容 Unix 秒、RFC3339 字符串、
/// `{"Time":..,"Valid":..}`、null，统一为 Unix 秒，无效时为 0
pub fn deserialize_null_time<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Unix(i64),
        Text(String),
        Wrapped {
            #[serde(rename = "Time")]
            time: String,
            #[serde(rename = "Valid")]
            valid: bool,
        },
    }

    let parse = |s: &str| {
        chrono::DateTime::parse_from_rfc3339(s)
            .map(|t| t.timestamp())
            .unwrap_or(0)
    };

    let repr: Option<Repr> = Option::deserialize(deserializer)?;
    Ok(match repr {
        Some(Repr::Unix(v)) => v,
        Some(Repr::Text(s)) => parse(&s),
        Some(Repr::Wrapped { time, valid }) => {
            if valid {
                parse(&time)
            } else {
                0
            }
        }
        None => 0,
    })
}

/// AUTH 帧的 JSON body
#[derive(Debug, Serialize)]
pub struct AuthPayload {
    pub mid: i64,
    pub key: String,
    pub room_id: String,
    pub platform: String,
    pub accepts: Vec<i32>,
}

/// 非消息类推送通知，由 body 中的 `type` 字段区分
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushNotice {
    GroupUpdate {
        group_id: i64,
        #[serde(default)]
        group_no: Option<String>,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        avatar: Option<String>,
        #[serde(default)]
        timestamp: i64,
    },
    UserUpdate {
        user_id: i64,
        #[serde(default)]
        nickname: Option<String>,
        #[serde(default)]
        avatar: Option<String>,
        #[serde(default)]
        signature: Option<String>,
        #[serde(default)]
        timestamp: i64,
    },
    GroupMemberUpdate {
        group_id: i64,
        user_id: i64,
        #[serde(default)]
        nickname: Option<String>,
        #[serde(default)]
        avatar: Option<String>,
        #[serde(default)]
        timestamp: i64,
    },
}

/// 解析后的推送 body：聊天消息或通知
#[derive(Debug, Clone)]
pub enum PushBody {
    Chat(ChatMessage),
    Notice(PushNotice),
}

/// 清理推送 body 前缀
///
/// 房间批量推送的 body 前面可能带有控制字节、空白或前缀数据
/// （上游批量组帧的已知问题），这里移除控制字符并从第一个 `{`
/// 开始截取，再交给 JSON 解析。
pub fn clean_push_body(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .filter(|c| {
            !matches!(
                c,
                '\u{00}'..='\u{08}' | '\u{0b}' | '\u{0c}' | '\u{0e}'..='\u{1f}' | '\u{7f}'
            )
        })
        .collect();
    let cleaned = cleaned.trim();
    match cleaned.find('{') {
        Some(i) if i > 0 => cleaned[i..].to_string(),
        _ => cleaned.to_string(),
    }
}

/// 解析一条推送 body，按 `type` 标签区分聊天消息和通知
pub fn parse_push_body(raw: &str) -> anyhow::Result<PushBody> {
    let cleaned = clean_push_body(raw);
    let value: serde_json::Value = serde_json::from_str(&cleaned)?;
    if value.get("type").map_or(false, |t| t.is_string()) {
        Ok(PushBody::Notice(serde_json::from_value(value)?))
    } else {
        Ok(PushBody::Chat(serde_json::from_value(value)?))
    }
}

/// 用户摘要（会话列表接口带出的对端信息）
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserBrief {
    pub id: i64,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub nickname: String,
    #[serde(default)]
    pub avatar: String,
}

/// 统一的 API 响应包装结构体（包含 code、message、data）
/// data 字段可能为 null 或缺失，因此使用 `Option<T>`
#[derive(Debug, Deserialize)]
pub struct ApiResponse<T> {
    pub code: i32,
    #[serde(default)]
    pub message: String,
    pub data: Option<T>,
}

/// 通用 HTTP 响应处理函数：校验 HTTP 状态码和业务 code 后反序列化
/// 所有 REST 接口共用此方法
pub async fn handle_http_response<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
    operation_name: &str,
) -> anyhow::Result<ApiResponse<T>> {
    use anyhow::Context;

    let status = response.status();
    let body_bytes = response.bytes().await.context("读取响应 body 失败")?;
    let body_str = String::from_utf8_lossy(&body_bytes);

    if !status.is_success() {
        error!(
            "[HTTP] {}请求失败，HTTP状态: {}, 响应: {}",
            operation_name, status, body_str
        );
        return Err(anyhow::anyhow!("HTTP 错误 {}: {}", status, body_str));
    }
    debug!("[HTTP] {}请求成功，HTTP状态: {}", operation_name, status);

    let api_resp: ApiResponse<T> = serde_json::from_slice(&body_bytes).map_err(|e| {
        error!(
            "[HTTP] {}反序列化失败: {:?}, 原始响应: {}",
            operation_name, e, body_str
        );
        anyhow::anyhow!("反序列化响应失败: {:?}", e)
    })?;

    if api_resp.code != 0 {
        error!(
            "[HTTP] {}服务器错误，code: {}, message: {}",
            operation_name, api_resp.code, api_resp.message
        );
        return Err(anyhow::anyhow!(
            "服务器错误 {}: {}",
            api_resp.code,
            api_resp.message
        ));
    }

    Ok(api_resp)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_message_from_push_json() {
        let raw = r#"{"msg_id":"m1","from_user_id":9001,"conversation_id":9001000009002,
            "conversation_type":1,"msg_type":1,"content":"hi","seq":5,"created_at":1700000000}"#;
        let msg: ChatMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(msg.msg_id.as_deref(), Some("m1"));
        assert_eq!(msg.conversation_type, ConversationType::Direct);
        assert_eq!(msg.created_at, 1_700_000_000);
    }

    #[test]
    fn test_chat_message_rest_timestamp() {
        let raw = r#"{"id":3,"msg_id":"m2","from_user_id":9002,"conversation_id":500,
            "conversation_type":2,"msg_type":1,"content":"x","seq":9,
            "created_at":"2023-11-14T22:13:20Z"}"#;
        let msg: ChatMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(msg.created_at, 1_700_000_000);
    }

    #[test]
    fn test_same_message_predicate() {
        let base = ChatMessage {
            msg_id: Some("a".to_string()),
            from_user_id: 1,
            conversation_id: 10,
            conversation_type: ConversationType::Direct,
            msg_type: msg_type::TEXT,
            content: "hi".to_string(),
            seq: 3,
            created_at: 0,
        };
        let mut by_id = base.clone();
        by_id.seq = 99;
        assert!(base.same_message(&by_id));

        let mut by_seq = base.clone();
        by_seq.msg_id = None;
        assert!(base.same_message(&by_seq));

        let mut other = base.clone();
        other.msg_id = Some("b".to_string());
        other.seq = 4;
        assert!(!base.same_message(&other));
    }

    #[test]
    fn test_clean_push_body_strips_prefix() {
        let raw = "\u{0}\u{1}  junk{\"seq\":1}";
        assert_eq!(clean_push_body(raw), "{\"seq\":1}");
        assert_eq!(clean_push_body("  {\"a\":1}  "), "{\"a\":1}");
        assert_eq!(clean_push_body("{\"a\":1}"), "{\"a\":1}");
    }

    #[test]
    fn test_parse_push_body_chat_with_prefix_bytes() {
        let raw = "\u{0}\u{0}\u{1f}{\"msg_id\":\"m9\",\"from_user_id\":1,\
            \"conversation_id\":500,\"conversation_type\":2,\"msg_type\":1,\
            \"content\":\"hey\",\"seq\":2,\"created_at\":1}";
        match parse_push_body(raw).unwrap() {
            PushBody::Chat(msg) => assert_eq!(msg.msg_id.as_deref(), Some("m9")),
            other => panic!("期望聊天消息，实际 {:?}", other),
        }
    }

    #[test]
    fn test_parse_push_body_notice() {
        let raw = r#"{"type":"group_update","group_id":500,"name":"新群名","timestamp":1}"#;
        match parse_push_body(raw).unwrap() {
            PushBody::Notice(PushNotice::GroupUpdate { group_id, name, .. }) => {
                assert_eq!(group_id, 500);
                assert_eq!(name.as_deref(), Some("新群名"));
            }
            other => panic!("期望群更新通知，实际 {:?}", other),
        }

        let raw = r#"{"type":"user_update","user_id":9002,"nickname":"小明","timestamp":1}"#;
        assert!(matches!(
            parse_push_body(raw).unwrap(),
            PushBody::Notice(PushNotice::UserUpdate { user_id: 9002, .. })
        ));
    }

    #[test]
    fn test_parse_push_body_garbage() {
        assert!(parse_push_body("not json at all").is_err());
    }

    #[test]
    fn test_null_string_wrappers() {
        #[derive(Deserialize)]
        struct Holder {
            #[serde(default, deserialize_with = "deserialize_null_string")]
            v: String,
        }
        let h: Holder = serde_json::from_str(r#"{"v":"hello"}"#).unwrap();
        assert_eq!(h.v, "hello");
        let h: Holder = serde_json::from_str(r#"{"v":{"String":"hi","Valid":true}}"#).unwrap();
        assert_eq!(h.v, "hi");
        let h: Holder = serde_json::from_str(r#"{"v":{"String":"x","Valid":false}}"#).unwrap();
        assert_eq!(h.v, "");
        let h: Holder = serde_json::from_str(r#"{"v":null}"#).unwrap();
        assert_eq!(h.v, "");
    }

    #[test]
    fn test_null_time_wrappers() {
        #[derive(Deserialize)]
        struct Holder {
            #[serde(default, deserialize_with = "deserialize_null_time")]
            t: i64,
        }
        let h: Holder =
            serde_json::from_str(r#"{"t":{"Time":"2023-11-14T22:13:20Z","Valid":true}}"#).unwrap();
        assert_eq!(h.t, 1_700_000_000);
        let h: Holder = serde_json::from_str(r#"{"t":null}"#).unwrap();
        assert_eq!(h.t, 0);
    }
}
