//! 会话标识派生
//!
//! 纯函数，无状态无 I/O。单聊会话 ID 由两个用户 ID 通过对称配对函数合成，
//! 与服务端 `GetConversationPairID` 的算法保持一致；群聊 / 机器人会话直接
//! 使用群 ID / 机器人 ID。

use serde::{Deserialize, Serialize};

/// 配对函数的进位基数，用户 ID 必须小于该值
const PAIR_BASE: i64 = 1_000_000_000;

/// 会话类型：1=单聊, 2=群聊, 3=AI 机器人
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum ConversationType {
    Direct,
    Group,
    Bot,
}

impl TryFrom<i32> for ConversationType {
    type Error = String;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(ConversationType::Direct),
            2 => Ok(ConversationType::Group),
            3 => Ok(ConversationType::Bot),
            other => Err(format!("未知会话类型: {}", other)),
        }
    }
}

impl From<ConversationType> for i32 {
    fn from(value: ConversationType) -> Self {
        match value {
            ConversationType::Direct => 1,
            ConversationType::Group => 2,
            ConversationType::Bot => 3,
        }
    }
}

/// 会话主键：会话 ID + 会话类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationKey {
    pub conversation_id: i64,
    pub conversation_type: ConversationType,
}

impl std::fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}",
            self.conversation_id,
            i32::from(self.conversation_type)
        )
    }
}

/// 单聊配对 ID：`min * 1e9 + max`，与参数顺序无关
///
/// 自聊是 `a == b` 的退化情况。
pub fn pair_id(a: i64, b: i64) -> i64 {
    let (low, high) = if a <= b { (a, b) } else { (b, a) };
    low * PAIR_BASE + high
}

/// 根据已知会话 ID 和类型构造会话主键
pub fn key_for(conversation_id: i64, conversation_type: ConversationType) -> ConversationKey {
    ConversationKey {
        conversation_id,
        conversation_type,
    }
}

/// 根据目标 ID 构造会话主键：单聊走配对函数，群聊 / 机器人直接用目标 ID
pub fn key_for_target(
    my_id: i64,
    target_id: i64,
    conversation_type: ConversationType,
) -> ConversationKey {
    let conversation_id = match conversation_type {
        ConversationType::Direct => pair_id(my_id, target_id),
        ConversationType::Group | ConversationType::Bot => target_id,
    };
    key_for(conversation_id, conversation_type)
}

/// 从单聊会话 ID 反推对端用户 ID（`pair_id` 在已知一方时的逆函数）
///
/// 自聊会话返回 `my_id` 本身。若 `my_id` 不在配对中（不应发生），
/// 退回较小的一方。
pub fn reverse_direct(conversation_id: i64, my_id: i64) -> i64 {
    let low = conversation_id / PAIR_BASE;
    let high = conversation_id % PAIR_BASE;
    if low == my_id {
        high
    } else if high == my_id {
        low
    } else {
        low
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pair_id_symmetry() {
        assert_eq!(pair_id(9001, 9002), 9_001_000_009_002);
        assert_eq!(pair_id(9002, 9001), 9_001_000_009_002);
        assert_eq!(pair_id(1, 999_999_999), pair_id(999_999_999, 1));
    }

    #[test]
    fn test_self_chat() {
        let conv_id = pair_id(42, 42);
        assert_eq!(conv_id, 42_000_000_042);
        assert_eq!(reverse_direct(conv_id, 42), 42);
    }

    #[test]
    fn test_reverse_direct_both_sides() {
        let conv_id = pair_id(9001, 9002);
        assert_eq!(reverse_direct(conv_id, 9001), 9002);
        assert_eq!(reverse_direct(conv_id, 9002), 9001);
    }

    #[test]
    fn test_key_for_target() {
        let key = key_for_target(9001, 9002, ConversationType::Direct);
        assert_eq!(key.conversation_id, 9_001_000_009_002);
        assert_eq!(key.conversation_type, ConversationType::Direct);

        let key = key_for_target(9001, 500, ConversationType::Group);
        assert_eq!(key.conversation_id, 500);

        let key = key_for_target(9001, 9001, ConversationType::Bot);
        assert_eq!(key.conversation_id, 9001);
    }

    #[test]
    fn test_conversation_type_serde() {
        let ty: ConversationType = serde_json::from_str("1").unwrap();
        assert_eq!(ty, ConversationType::Direct);
        assert_eq!(serde_json::to_string(&ConversationType::Bot).unwrap(), "3");
        assert!(serde_json::from_str::<ConversationType>("9").is_err());
    }
}
