//! 聊天客户端门面
//!
//! 组合推送连接、REST 客户端和调度任务，向上提供打开会话、发送消息、
//! 翻页等操作。所有状态读写都通过调度命令完成，客户端自身可克隆。

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::im::api::{ChatApi, SendMessageReq};
use crate::im::connection::{ConnState, ConnectionManager};
use crate::im::conversation::ConversationSummary;
use crate::im::identity::{key_for_target, ConversationKey, ConversationType};
use crate::im::listener::{ChatListener, EmptyChatListener};
use crate::im::reconciler::{run_dispatcher, ReconcileCommand, Reconciler};
use crate::im::types::{msg_type, ChatMessage};

/// 客户端配置
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// 当前账号的用户 ID
    pub user_id: i64,
    /// 登录获得的 token
    pub token: String,
    /// 推送网关地址
    pub ws_url: String,
    /// REST 接口前缀
    pub api_base_url: String,
    /// 认证时上报的平台标识
    pub platform: String,
    /// 订阅的推送操作码
    pub accepts: Vec<i32>,
    /// 打开会话时拉取的首页条数
    pub history_page_size: usize,
    /// 向前翻页每页条数
    pub older_page_size: usize,
}

impl ClientConfig {
    pub fn new(user_id: i64, token: &str) -> Self {
        Self {
            user_id,
            token: token.to_string(),
            ws_url: "ws://localhost:3102/sub".to_string(),
            api_base_url: "http://localhost:3112/api".to_string(),
            platform: "web".to_string(),
            accepts: vec![1001, 1002, 1003],
            history_page_size: 50,
            older_page_size: 20,
        }
    }
}

/// 聊天客户端
#[derive(Clone)]
pub struct ChatClient {
    config: ClientConfig,
    api: Arc<ChatApi>,
    conn: ConnectionManager,
    commands: mpsc::Sender<ReconcileCommand>,
}

impl ChatClient {
    pub fn new(config: ClientConfig) -> Result<Self> {
        Self::with_listener(config, Arc::new(EmptyChatListener))
    }

    /// 创建客户端并启动调度任务，事件通过 `listener` 回调
    pub fn with_listener(config: ClientConfig, listener: Arc<dyn ChatListener>) -> Result<Self> {
        let api = Arc::new(ChatApi::new(&config.api_base_url, &config.token)?);
        let (commands, command_rx) = mpsc::channel(256);
        let conn = ConnectionManager::new(
            &config.ws_url,
            &config.platform,
            config.accepts.clone(),
            commands.clone(),
        );
        let reconciler = Reconciler::new(config.user_id);
        tokio::spawn(run_dispatcher(reconciler, command_rx, listener));
        Ok(Self {
            config,
            api,
            conn,
            commands,
        })
    }

    pub fn connection_state(&self) -> ConnState {
        self.conn.state()
    }

    /// 建立推送连接并初始化会话列表
    ///
    /// 会话列表拉取失败只告警，不阻塞连接，后续推送仍会就地建会话。
    pub async fn connect(&self) -> Result<()> {
        self.conn.connect(self.config.user_id);
        self.conn
            .await_authenticated(Duration::from_secs(10))
            .await?;

        match self.api.get_conversation_list().await {
            Ok(list) => {
                let conversations: Vec<ConversationSummary> =
                    list.into_iter().filter_map(|dto| dto.into_summary()).collect();
                self.commands
                    .send(ReconcileCommand::Seed { conversations })
                    .await
                    .context("调度任务已退出")?;
            }
            Err(e) => warn!("[Client] 会话列表初始化失败: {:?}", e),
        }
        info!("[Client] ✅ 客户端就绪: user_id={}", self.config.user_id);
        Ok(())
    }

    /// 打开会话：首次打开先拉首页历史，然后清零未读并上报已读
    ///
    /// 返回合并后的消息窗口快照。历史拉取失败时会话保持未加载，
    /// 下次打开重试；已读上报失败只告警。
    pub async fn open_conversation(&self, key: ConversationKey) -> Result<Vec<ChatMessage>> {
        let (loaded, _) = self.session_status(key).await?;
        if !loaded {
            match self
                .api
                .get_history(
                    key.conversation_id,
                    key.conversation_type,
                    self.config.history_page_size,
                    None,
                )
                .await
            {
                Ok(messages) => {
                    self.merge_history(key, messages, self.config.history_page_size)
                        .await?;
                }
                Err(e) => warn!("[Client] 历史拉取失败，稍后重试: {:?}", e),
            }
        }

        let (tx, rx) = oneshot::channel();
        self.commands
            .send(ReconcileCommand::Opened { key, reply: tx })
            .await
            .context("调度任务已退出")?;
        let last_msg_id = rx.await.context("调度任务已退出")?;

        if let Some(msg_id) = last_msg_id {
            if let Err(e) = self
                .api
                .mark_read(key.conversation_id, key.conversation_type, &msg_id)
                .await
            {
                warn!("[Client] 已读上报失败: {:?}", e);
            }
        }
        self.session_messages(key).await
    }

    /// 发送消息：先走 REST 拿服务端权威字段，成功后写入本地
    ///
    /// 机器人会话由独立的流式通道负责，不在本通道发送。
    pub async fn send_message(
        &self,
        target_id: i64,
        conversation_type: ConversationType,
        message_type: i32,
        content: &str,
    ) -> Result<ChatMessage> {
        if conversation_type == ConversationType::Bot {
            anyhow::bail!("机器人会话不支持普通消息通道");
        }
        let (to_user_id, to_group_id) = match conversation_type {
            ConversationType::Direct => (Some(target_id), None),
            _ => (None, Some(target_id)),
        };
        let req = SendMessageReq {
            to_user_id,
            to_group_id,
            conversation_type,
            msg_type: message_type,
            content: content.to_string(),
        };
        let resp = self.api.send_message(&req).await?;

        let message = ChatMessage {
            msg_id: Some(resp.msg_id),
            from_user_id: self.config.user_id,
            conversation_id: resp.conversation_id,
            conversation_type: resp.conversation_type,
            msg_type: message_type,
            content: content.to_string(),
            seq: resp.seq,
            created_at: resp.created_at,
        };
        self.commands
            .send(ReconcileCommand::AppendLocal {
                message: message.clone(),
            })
            .await
            .context("调度任务已退出")?;
        Ok(message)
    }

    pub async fn send_text_message(
        &self,
        target_id: i64,
        conversation_type: ConversationType,
        content: &str,
    ) -> Result<ChatMessage> {
        self.send_message(target_id, conversation_type, msg_type::TEXT, content)
            .await
    }

    /// 向前翻一页历史，返回实际新增条数；已到最早一页时返回 0
    pub async fn load_older_messages(&self, key: ConversationKey) -> Result<usize> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(ReconcileCommand::OlderCursor { key, reply: tx })
            .await
            .context("调度任务已退出")?;
        let cursor = match rx.await.context("调度任务已退出")? {
            Some(seq) => seq,
            None => return Ok(0),
        };

        let messages = self
            .api
            .get_history(
                key.conversation_id,
                key.conversation_type,
                self.config.older_page_size,
                Some(cursor),
            )
            .await?;
        self.merge_history(key, messages, self.config.older_page_size)
            .await
    }

    /// 当前会话列表快照
    pub async fn conversation_list(&self) -> Result<Vec<ConversationSummary>> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(ReconcileCommand::Conversations { reply: tx })
            .await
            .context("调度任务已退出")?;
        rx.await.context("调度任务已退出")
    }

    /// 某会话的消息窗口快照
    pub async fn session_messages(&self, key: ConversationKey) -> Result<Vec<ChatMessage>> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(ReconcileCommand::SessionSnapshot { key, reply: tx })
            .await
            .context("调度任务已退出")?;
        rx.await.context("调度任务已退出")
    }

    pub async fn total_unread(&self) -> Result<i64> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(ReconcileCommand::TotalUnread { reply: tx })
            .await
            .context("调度任务已退出")?;
        rx.await.context("调度任务已退出")
    }

    /// 根据目标推导会话键，见 [`key_for_target`]
    pub fn conversation_key(&self, target_id: i64, ty: ConversationType) -> ConversationKey {
        key_for_target(self.config.user_id, target_id, ty)
    }

    /// 切换房间订阅
    pub async fn change_room(&self, room_id: &str) -> Result<String> {
        self.conn.change_room(room_id).await
    }

    /// 离开当前会话界面，之后的新消息恢复累计未读
    pub async fn close_conversation(&self) -> Result<()> {
        self.commands
            .send(ReconcileCommand::CloseActive)
            .await
            .context("调度任务已退出")
    }

    /// 清空全部本地状态（退出登录时）
    pub async fn clear_local_state(&self) -> Result<()> {
        self.commands
            .send(ReconcileCommand::Clear)
            .await
            .context("调度任务已退出")
    }

    /// 断开推送连接，不再重连
    pub async fn disconnect(&self) {
        self.conn.disconnect().await;
    }

    async fn session_status(&self, key: ConversationKey) -> Result<(bool, bool)> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(ReconcileCommand::SessionStatus { key, reply: tx })
            .await
            .context("调度任务已退出")?;
        rx.await.context("调度任务已退出")
    }

    async fn merge_history(
        &self,
        key: ConversationKey,
        messages: Vec<ChatMessage>,
        limit: usize,
    ) -> Result<usize> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(ReconcileCommand::MergeHistory {
                key,
                messages,
                limit,
                reply: tx,
            })
            .await
            .context("调度任务已退出")?;
        rx.await.context("调度任务已退出")
    }
}
