//! 状态合并调度
//!
//! 所有会话状态（消息窗口、会话索引、当前查看的会话）由单个调度任务
//! 独占持有，推送帧和 REST 结果都转成命令排队进来，天然避免并发
//! 读写。需要返回值的命令带 oneshot 应答通道。

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::im::conversation::{ConversationIndex, ConversationSummary};
use crate::im::identity::{key_for, reverse_direct, ConversationKey, ConversationType};
use crate::im::listener::ChatListener;
use crate::im::protocol::Frame;
use crate::im::session::SessionStore;
use crate::im::types::{msg_type, parse_push_body, ChatMessage, PushBody, PushNotice};

/// 调度任务接受的命令
pub enum ReconcileCommand {
    /// 推送通道收到的一帧
    Frame(Frame),
    /// 连接状态变化，转发给监听器
    ConnectionStatus { connected: bool, detail: String },
    /// 查询会话的历史加载状态 (is_history_loaded, is_history_all_loaded)
    SessionStatus {
        key: ConversationKey,
        reply: oneshot::Sender<(bool, bool)>,
    },
    /// 合并一页历史，应答实际新增条数
    MergeHistory {
        key: ConversationKey,
        messages: Vec<ChatMessage>,
        limit: usize,
        reply: oneshot::Sender<usize>,
    },
    /// 打开会话：置为当前查看、清零未读，应答最新一条消息的 msg_id
    Opened {
        key: ConversationKey,
        reply: oneshot::Sender<Option<String>>,
    },
    /// 查询向前翻页的游标（最早一条的 seq），到底时应答 None
    OlderCursor {
        key: ConversationKey,
        reply: oneshot::Sender<Option<i64>>,
    },
    /// 写入本地发出的消息（已带服务端权威字段）
    AppendLocal { message: ChatMessage },
    /// 关闭当前查看的会话
    CloseActive,
    /// 用服务端会话列表初始化索引
    Seed {
        conversations: Vec<ConversationSummary>,
    },
    /// 会话列表快照
    Conversations {
        reply: oneshot::Sender<Vec<ConversationSummary>>,
    },
    /// 会话消息窗口快照
    SessionSnapshot {
        key: ConversationKey,
        reply: oneshot::Sender<Vec<ChatMessage>>,
    },
    /// 全局未读总数
    TotalUnread { reply: oneshot::Sender<i64> },
    /// 清空全部本地状态（退出登录）
    Clear,
}

/// 调度过程中产生的、需要回调给监听器的事件
enum ReconcileEvent {
    ConnectionStatus { connected: bool, detail: String },
    NewMessage(ChatMessage),
    NewConversation(ConversationSummary),
    ConversationsChanged(Vec<ConversationSummary>),
    TotalUnreadChanged(i64),
}

/// 会话状态的唯一持有者
pub struct Reconciler {
    user_id: i64,
    sessions: SessionStore,
    index: ConversationIndex,
    /// 当前正在查看的会话，新消息到达时据此决定未读是否累加
    active: Option<ConversationKey>,
    last_total_unread: i64,
}

impl Reconciler {
    pub fn new(user_id: i64) -> Self {
        Self {
            user_id,
            sessions: SessionStore::new(),
            index: ConversationIndex::new(),
            active: None,
            last_total_unread: 0,
        }
    }

    fn handle(&mut self, cmd: ReconcileCommand) -> Vec<ReconcileEvent> {
        match cmd {
            ReconcileCommand::Frame(frame) => self.handle_frame(frame),
            ReconcileCommand::ConnectionStatus { connected, detail } => {
                vec![ReconcileEvent::ConnectionStatus { connected, detail }]
            }
            ReconcileCommand::SessionStatus { key, reply } => {
                let status = self
                    .sessions
                    .get(&key)
                    .map(|s| (s.is_history_loaded, s.is_history_all_loaded))
                    .unwrap_or((false, false));
                let _ = reply.send(status);
                Vec::new()
            }
            ReconcileCommand::MergeHistory {
                key,
                messages,
                limit,
                reply,
            } => {
                let inserted = self.sessions.merge_history_page(key, messages, limit);
                debug!("[Sync] 历史合并 {}: 新增 {} 条", key, inserted);
                let _ = reply.send(inserted);
                Vec::new()
            }
            ReconcileCommand::Opened { key, reply } => {
                let last_msg_id = self.mark_opened(key);
                let _ = reply.send(last_msg_id);
                let mut events = vec![ReconcileEvent::ConversationsChanged(self.index.list())];
                events.extend(self.unread_delta());
                events
            }
            ReconcileCommand::OlderCursor { key, reply } => {
                let cursor = self.older_cursor(&key);
                let _ = reply.send(cursor);
                Vec::new()
            }
            ReconcileCommand::AppendLocal { message } => self.append_local(message),
            ReconcileCommand::CloseActive => {
                self.active = None;
                Vec::new()
            }
            ReconcileCommand::Seed { conversations } => {
                info!("[Sync] 会话索引初始化: {} 条", conversations.len());
                self.index.seed(conversations);
                let mut events = vec![ReconcileEvent::ConversationsChanged(self.index.list())];
                events.extend(self.unread_delta());
                events
            }
            ReconcileCommand::Conversations { reply } => {
                let _ = reply.send(self.index.list());
                Vec::new()
            }
            ReconcileCommand::SessionSnapshot { key, reply } => {
                let messages = self
                    .sessions
                    .get(&key)
                    .map(|s| s.messages.clone())
                    .unwrap_or_default();
                let _ = reply.send(messages);
                Vec::new()
            }
            ReconcileCommand::TotalUnread { reply } => {
                let _ = reply.send(self.index.total_unread());
                Vec::new()
            }
            ReconcileCommand::Clear => {
                self.sessions.clear();
                self.index.clear();
                self.active = None;
                self.last_total_unread = 0;
                Vec::new()
            }
        }
    }

    /// 解析并合并一帧推送
    fn handle_frame(&mut self, frame: Frame) -> Vec<ReconcileEvent> {
        let body = frame.body_text();
        match parse_push_body(&body) {
            Ok(PushBody::Chat(message)) => self.merge_live(message),
            Ok(PushBody::Notice(notice)) => self.apply_notice(notice),
            Err(e) => {
                warn!(
                    "[Sync] 丢弃无法解析的推送 body (op={}): {:?}",
                    frame.op.name(),
                    e
                );
                Vec::new()
            }
        }
    }

    /// 合并一条实时消息：去重写入窗口，刷新会话索引和未读数
    fn merge_live(&mut self, message: ChatMessage) -> Vec<ReconcileEvent> {
        let key = key_for(message.conversation_id, message.conversation_type);
        if !self.sessions.append_live(key, message.clone()) {
            debug!("[Sync] 重复消息已忽略: {:?}", message.msg_id);
            return Vec::new();
        }

        let from_self = message.from_user_id == self.user_id;
        let viewing = self.active == Some(key);
        let is_new_conversation = !self.index.contains(&key);
        let target_id = match key.conversation_type {
            ConversationType::Direct => reverse_direct(key.conversation_id, self.user_id),
            ConversationType::Group | ConversationType::Bot => key.conversation_id,
        };
        self.index.touch(
            key,
            target_id,
            &build_preview(&message),
            message.created_at,
            from_self || viewing,
        );

        let mut events = vec![ReconcileEvent::NewMessage(message)];
        if is_new_conversation {
            if let Some(front) = self.index.list().into_iter().next() {
                events.push(ReconcileEvent::NewConversation(front));
            }
        }
        events.push(ReconcileEvent::ConversationsChanged(self.index.list()));
        events.extend(self.unread_delta());
        events
    }

    /// 应用一条资料变更通知
    fn apply_notice(&mut self, notice: PushNotice) -> Vec<ReconcileEvent> {
        match notice {
            PushNotice::GroupUpdate {
                group_id,
                name,
                avatar,
                ..
            } => {
                info!("[Sync] 群资料更新: group_id={}", group_id);
                self.index
                    .update_group(group_id, name.as_deref(), avatar.as_deref());
                vec![ReconcileEvent::ConversationsChanged(self.index.list())]
            }
            PushNotice::UserUpdate {
                user_id,
                nickname,
                avatar,
                ..
            } => {
                info!("[Sync] 用户资料更新: user_id={}", user_id);
                self.index
                    .update_user(user_id, nickname.as_deref(), avatar.as_deref());
                vec![ReconcileEvent::ConversationsChanged(self.index.list())]
            }
            PushNotice::GroupMemberUpdate {
                group_id, user_id, ..
            } => {
                // 本地不持有群成员表，成员资料在重新打开会话时取
                debug!(
                    "[Sync] 群成员更新: group_id={}, user_id={}",
                    group_id, user_id
                );
                Vec::new()
            }
        }
    }

    fn append_local(&mut self, message: ChatMessage) -> Vec<ReconcileEvent> {
        let key = key_for(message.conversation_id, message.conversation_type);
        let target_id = match key.conversation_type {
            ConversationType::Direct => reverse_direct(key.conversation_id, self.user_id),
            ConversationType::Group | ConversationType::Bot => key.conversation_id,
        };
        let preview = build_preview(&message);
        let created_at = message.created_at;
        if !self.sessions.append_live(key, message) {
            // 推送先于 REST 应答到达本端，索引已刷新过
            return Vec::new();
        }
        self.index.touch(key, target_id, &preview, created_at, true);
        vec![ReconcileEvent::ConversationsChanged(self.index.list())]
    }

    fn mark_opened(&mut self, key: ConversationKey) -> Option<String> {
        self.active = Some(key);
        self.index.clear_unread(&key);
        self.sessions
            .get(&key)
            .and_then(|s| s.messages.last())
            .and_then(|m| m.msg_id.clone())
    }

    fn older_cursor(&self, key: &ConversationKey) -> Option<i64> {
        let session = self.sessions.get(key)?;
        if session.is_history_all_loaded {
            return None;
        }
        session.messages.first().map(|m| m.seq)
    }

    /// 未读总数有变化时产生事件
    fn unread_delta(&mut self) -> Option<ReconcileEvent> {
        let total = self.index.total_unread();
        if total != self.last_total_unread {
            self.last_total_unread = total;
            Some(ReconcileEvent::TotalUnreadChanged(total))
        } else {
            None
        }
    }
}

/// 消息列表预览文案
fn build_preview(message: &ChatMessage) -> String {
    match message.msg_type {
        msg_type::TEXT | msg_type::SYSTEM => message.content.clone(),
        msg_type::IMAGE => "[图片]".to_string(),
        msg_type::VOICE => "[语音]".to_string(),
        msg_type::VIDEO => "[视频]".to_string(),
        msg_type::FILE => "[文件]".to_string(),
        _ => "[未知消息]".to_string(),
    }
}

/// 调度循环：独占 `Reconciler`，顺序消费命令并回调监听器
pub async fn run_dispatcher(
    mut reconciler: Reconciler,
    mut commands: mpsc::Receiver<ReconcileCommand>,
    listener: Arc<dyn ChatListener>,
) {
    while let Some(cmd) = commands.recv().await {
        for event in reconciler.handle(cmd) {
            match event {
                ReconcileEvent::ConnectionStatus { connected, detail } => {
                    listener.on_connection_status_changed(connected, detail).await;
                }
                ReconcileEvent::NewMessage(message) => {
                    listener.on_recv_new_message(message).await;
                }
                ReconcileEvent::NewConversation(conversation) => {
                    listener.on_new_conversation(conversation).await;
                }
                ReconcileEvent::ConversationsChanged(conversations) => {
                    listener.on_conversation_changed(conversations).await;
                }
                ReconcileEvent::TotalUnreadChanged(total) => {
                    listener.on_total_unread_count_changed(total).await;
                }
            }
        }
    }
    debug!("[Sync] 调度任务退出");
}
