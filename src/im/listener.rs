//! 事件监听器
//!
//! 连接状态、新消息、会话列表变化通过监听器回调到上层（UI / CLI）。
//! 回调在调度任务上执行，实现方不应在回调里做耗时操作。

use async_trait::async_trait;

use crate::im::conversation::ConversationSummary;
use crate::im::types::ChatMessage;

#[async_trait]
pub trait ChatListener: Send + Sync {
    /// 连接状态变化：`connected` 为认证是否就绪，`detail` 为说明文本
    async fn on_connection_status_changed(&self, connected: bool, detail: String) {
        let _ = (connected, detail);
    }

    /// 收到一条新消息（已经过去重）
    async fn on_recv_new_message(&self, message: ChatMessage) {
        let _ = message;
    }

    /// 会话列表发生变化（新消息、未读数、资料更新）
    async fn on_conversation_changed(&self, conversations: Vec<ConversationSummary>) {
        let _ = conversations;
    }

    /// 出现此前不存在的会话
    async fn on_new_conversation(&self, conversation: ConversationSummary) {
        let _ = conversation;
    }

    /// 全局未读总数变化
    async fn on_total_unread_count_changed(&self, total: i64) {
        let _ = total;
    }
}

/// 空实现，适合只关心部分回调的调用方做基底
pub struct EmptyChatListener;

#[async_trait]
impl ChatListener for EmptyChatListener {}
