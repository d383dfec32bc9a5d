//! REST 接口封装
//!
//! 历史消息、发送、已读回执、会话列表都走这里，统一带 Bearer token
//! 并复用通用响应处理。

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::im::conversation::ConversationDto;
use crate::im::identity::ConversationType;
use crate::im::types::{handle_http_response, ChatMessage};

/// 历史消息接口的 data 字段
#[derive(Debug, Deserialize)]
pub struct HistoryData {
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub has_more: bool,
    #[serde(default)]
    pub user_id: i64,
}

/// 发送消息请求体，单聊填 to_user_id，群聊填 to_group_id
#[derive(Debug, Serialize)]
pub struct SendMessageReq {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_user_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_group_id: Option<i64>,
    pub conversation_type: ConversationType,
    pub msg_type: i32,
    pub content: String,
}

/// 发送接口返回的服务端权威字段
#[derive(Debug, Deserialize)]
pub struct SendMessageResp {
    pub msg_id: String,
    pub conversation_id: i64,
    pub conversation_type: ConversationType,
    pub seq: i64,
    #[serde(default, deserialize_with = "crate::im::types::deserialize_timestamp")]
    pub created_at: i64,
}

#[derive(Debug, Serialize)]
struct MarkReadReq<'a> {
    conversation_id: i64,
    conversation_type: ConversationType,
    msg_id: &'a str,
}

/// 聊天 REST 客户端
#[derive(Debug, Clone)]
pub struct ChatApi {
    client: reqwest::Client,
    api_base_url: String,
}

impl ChatApi {
    /// 构造客户端，后续请求都带 `Authorization: Bearer <token>`
    pub fn new(api_base_url: &str, token: &str) -> Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        let mut auth = reqwest::header::HeaderValue::from_str(&format!("Bearer {}", token))
            .context("token 包含非法字符")?;
        auth.set_sensitive(true);
        headers.insert(reqwest::header::AUTHORIZATION, auth);
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .context("构造 HTTP 客户端失败")?;
        Ok(Self {
            client,
            api_base_url: api_base_url.trim_end_matches('/').to_string(),
        })
    }

    /// 拉取一页历史消息，`last_seq` 为 None 时取最新一页
    pub async fn get_history(
        &self,
        conversation_id: i64,
        conversation_type: ConversationType,
        limit: usize,
        last_seq: Option<i64>,
    ) -> Result<Vec<ChatMessage>> {
        let url = format!("{}/message/history", self.api_base_url);
        let mut query: Vec<(&str, String)> = vec![
            ("conversation_id", conversation_id.to_string()),
            ("conversation_type", i32::from(conversation_type).to_string()),
            ("limit", limit.to_string()),
        ];
        if let Some(seq) = last_seq {
            query.push(("last_seq", seq.to_string()));
        }
        debug!(
            "[API] 拉取历史: conversation_id={}, last_seq={:?}, limit={}",
            conversation_id, last_seq, limit
        );

        let response = self
            .client
            .get(&url)
            .query(&query)
            .send()
            .await
            .context("历史消息请求失败")?;
        let api_resp = handle_http_response::<HistoryData>(response, "历史消息").await?;
        let data = api_resp.data.unwrap_or_else(|| HistoryData {
            messages: Vec::new(),
            has_more: false,
            user_id: 0,
        });
        info!(
            "[API] 历史消息返回 {} 条, has_more={}",
            data.messages.len(),
            data.has_more
        );
        Ok(data.messages)
    }

    /// 发送消息，失败时直接返回错误，不做本地写入
    pub async fn send_message(&self, req: &SendMessageReq) -> Result<SendMessageResp> {
        let url = format!("{}/message/send", self.api_base_url);
        let response = self
            .client
            .post(&url)
            .json(req)
            .send()
            .await
            .context("发送消息请求失败")?;
        let api_resp = handle_http_response::<SendMessageResp>(response, "发送消息").await?;
        let data = api_resp
            .data
            .ok_or_else(|| anyhow::anyhow!("发送消息响应缺少 data"))?;
        info!(
            "[API] ✅ 发送成功: msg_id={}, seq={}",
            data.msg_id, data.seq
        );
        Ok(data)
    }

    /// 上报已读位置
    pub async fn mark_read(
        &self,
        conversation_id: i64,
        conversation_type: ConversationType,
        msg_id: &str,
    ) -> Result<()> {
        let url = format!("{}/message/read", self.api_base_url);
        let body = MarkReadReq {
            conversation_id,
            conversation_type,
            msg_id,
        };
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .context("已读上报请求失败")?;
        handle_http_response::<serde_json::Value>(response, "已读上报").await?;
        debug!(
            "[API] 已读上报成功: conversation_id={}, msg_id={}",
            conversation_id, msg_id
        );
        Ok(())
    }

    /// 拉取会话列表
    pub async fn get_conversation_list(&self) -> Result<Vec<ConversationDto>> {
        let url = format!("{}/conversation/list", self.api_base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("会话列表请求失败")?;
        let api_resp =
            handle_http_response::<Vec<ConversationDto>>(response, "会话列表").await?;
        let list = api_resp.data.unwrap_or_default();
        info!("[API] 会话列表返回 {} 条", list.len());
        Ok(list)
    }
}
