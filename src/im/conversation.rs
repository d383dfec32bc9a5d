//! 会话列表索引
//!
//! 维护按活跃时间排列的会话摘要：最新消息预览、未读数、置顶 / 免打扰
//! 标记。有新消息的会话移动到列表头部。

use serde::Deserialize;

use crate::im::identity::{key_for, ConversationKey, ConversationType};
use crate::im::types::{deserialize_null_string, deserialize_null_time, UserBrief};

/// 会话摘要，供 UI 列表展示
#[derive(Debug, Clone)]
pub struct ConversationSummary {
    pub key: ConversationKey,
    /// 单聊为对端用户 ID，群聊 / 机器人为目标 ID
    pub target_id: i64,
    pub name: String,
    pub avatar: String,
    pub last_content: String,
    pub last_time: i64,
    pub unread_count: i32,
    pub is_pinned: bool,
    pub is_muted: bool,
}

/// 会话列表接口返回的一行
#[derive(Debug, Clone, Deserialize)]
pub struct ConversationDto {
    pub conversation_id: i64,
    pub conversation_type: i32,
    #[serde(default)]
    pub target_id: i64,
    #[serde(default, deserialize_with = "deserialize_null_string")]
    pub name: String,
    #[serde(default, deserialize_with = "deserialize_null_string")]
    pub avatar: String,
    #[serde(default, deserialize_with = "deserialize_null_string")]
    pub last_content: String,
    #[serde(default, deserialize_with = "deserialize_null_time")]
    pub last_time: i64,
    #[serde(default)]
    pub unread_count: i32,
    #[serde(default)]
    pub is_pinned: i32,
    #[serde(default)]
    pub is_muted: i32,
    #[serde(default)]
    pub target_user: Option<UserBrief>,
}

impl ConversationDto {
    /// 转换为本地摘要，单聊行优先使用 join 出来的对端资料
    pub fn into_summary(self) -> Option<ConversationSummary> {
        let ty = ConversationType::try_from(self.conversation_type).ok()?;
        let mut name = self.name;
        let mut avatar = self.avatar;
        let mut target_id = self.target_id;
        if let Some(user) = self.target_user {
            if name.is_empty() {
                name = if user.nickname.is_empty() {
                    user.username
                } else {
                    user.nickname
                };
            }
            if avatar.is_empty() {
                avatar = user.avatar;
            }
            if target_id == 0 {
                target_id = user.id;
            }
        }
        Some(ConversationSummary {
            key: key_for(self.conversation_id, ty),
            target_id,
            name,
            avatar,
            last_content: self.last_content,
            last_time: self.last_time,
            unread_count: self.unread_count,
            is_pinned: self.is_pinned != 0,
            is_muted: self.is_muted != 0,
        })
    }
}

/// 按活跃度排列的会话索引，仅由调度任务持有
#[derive(Debug, Default)]
pub struct ConversationIndex {
    items: Vec<ConversationSummary>,
}

impl ConversationIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// 用服务端会话列表覆盖本地索引
    pub fn seed(&mut self, conversations: Vec<ConversationSummary>) {
        self.items = conversations;
    }

    /// 记录一条新消息：刷新预览、更新未读数并把会话移到头部
    ///
    /// `reset_unread` 为 true（本人发送或正在查看）时未读归零，
    /// 否则加一。会话不存在时就地创建。
    pub fn touch(
        &mut self,
        key: ConversationKey,
        target_id: i64,
        content: &str,
        time: i64,
        reset_unread: bool,
    ) {
        let pos = self.items.iter().position(|c| c.key == key);
        let mut item = match pos {
            Some(i) => self.items.remove(i),
            None => ConversationSummary {
                key,
                target_id,
                name: String::new(),
                avatar: String::new(),
                last_content: String::new(),
                last_time: 0,
                unread_count: 0,
                is_pinned: false,
                is_muted: false,
            },
        };
        item.last_content = content.to_string();
        item.last_time = time;
        if reset_unread {
            item.unread_count = 0;
        } else {
            item.unread_count += 1;
        }
        self.items.insert(0, item);
    }

    pub fn contains(&self, key: &ConversationKey) -> bool {
        self.items.iter().any(|c| c.key == *key)
    }

    /// 打开会话时清零未读
    pub fn clear_unread(&mut self, key: &ConversationKey) {
        if let Some(item) = self.items.iter_mut().find(|c| c.key == *key) {
            item.unread_count = 0;
        }
    }

    pub fn total_unread(&self) -> i64 {
        self.items.iter().map(|c| c.unread_count as i64).sum()
    }

    /// 用户资料变更通知：刷新所有以该用户为对端的单聊会话
    pub fn update_user(&mut self, user_id: i64, nickname: Option<&str>, avatar: Option<&str>) {
        for item in self.items.iter_mut() {
            if item.key.conversation_type == ConversationType::Direct && item.target_id == user_id {
                if let Some(n) = nickname {
                    item.name = n.to_string();
                }
                if let Some(a) = avatar {
                    item.avatar = a.to_string();
                }
            }
        }
    }

    /// 群资料变更通知：刷新对应群会话
    pub fn update_group(&mut self, group_id: i64, name: Option<&str>, avatar: Option<&str>) {
        for item in self.items.iter_mut() {
            if item.key.conversation_type == ConversationType::Group
                && item.key.conversation_id == group_id
            {
                if let Some(n) = name {
                    item.name = n.to_string();
                }
                if let Some(a) = avatar {
                    item.avatar = a.to_string();
                }
            }
        }
    }

    pub fn list(&self) -> Vec<ConversationSummary> {
        self.items.clone()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}
