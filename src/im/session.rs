//! 会话消息缓存
//!
//! 每个会话维护一段按 seq 升序排列的消息窗口，历史分页和实时推送
//! 都通过统一的去重判据合并进来。

use std::collections::HashMap;

use crate::im::identity::ConversationKey;
use crate::im::types::ChatMessage;

/// 单个会话的消息窗口与分页状态
#[derive(Debug, Default)]
pub struct Session {
    pub messages: Vec<ChatMessage>,
    /// 首页历史是否已经拉取过
    pub is_history_loaded: bool,
    /// 是否已经翻到最早一页（短页即到底）
    pub is_history_all_loaded: bool,
}

impl Session {
    fn contains(&self, msg: &ChatMessage) -> bool {
        self.messages.iter().any(|m| m.same_message(msg))
    }
}

/// 所有会话的消息缓存，仅由调度任务持有
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: HashMap<ConversationKey, Session>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &ConversationKey) -> Option<&Session> {
        self.sessions.get(key)
    }

    pub fn get_or_create(&mut self, key: ConversationKey) -> &mut Session {
        self.sessions.entry(key).or_default()
    }

    /// 合并一页历史消息，返回实际新增条数
    ///
    /// 已存在的消息跳过，合并后按 seq 稳定排序。返回页不足 `limit`
    /// 条时认为已经到底。
    pub fn merge_history_page(
        &mut self,
        key: ConversationKey,
        messages: Vec<ChatMessage>,
        limit: usize,
    ) -> usize {
        let page_len = messages.len();
        let session = self.get_or_create(key);
        let mut inserted = 0usize;
        for msg in messages {
            if !session.contains(&msg) {
                session.messages.push(msg);
                inserted += 1;
            }
        }
        if inserted > 0 {
            session.messages.sort_by_key(|m| m.seq);
        }
        session.is_history_loaded = true;
        if page_len < limit {
            session.is_history_all_loaded = true;
        }
        inserted
    }

    /// 追加一条实时 / 本地消息，重复时返回 false
    pub fn append_live(&mut self, key: ConversationKey, msg: ChatMessage) -> bool {
        let session = self.get_or_create(key);
        if session.contains(&msg) {
            return false;
        }
        let out_of_order = session
            .messages
            .last()
            .map_or(false, |last| last.seq > msg.seq);
        session.messages.push(msg);
        if out_of_order {
            session.messages.sort_by_key(|m| m.seq);
        }
        true
    }

    pub fn clear(&mut self) {
        self.sessions.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::im::identity::{key_for, ConversationType};
    use crate::im::types::msg_type;

    fn msg(id: &str, from: i64, seq: i64) -> ChatMessage {
        ChatMessage {
            msg_id: Some(id.to_string()),
            from_user_id: from,
            conversation_id: 500,
            conversation_type: ConversationType::Group,
            msg_type: msg_type::TEXT,
            content: format!("msg-{}", seq),
            seq,
            created_at: seq,
        }
    }

    #[test]
    fn test_merge_history_dedup_and_order() {
        let key = key_for(500, ConversationType::Group);
        let mut store = SessionStore::new();

        let inserted = store.merge_history_page(
            key,
            vec![msg("c", 1, 3), msg("a", 1, 1), msg("b", 2, 2)],
            50,
        );
        assert_eq!(inserted, 3);

        // 重复合并同一页不新增
        let inserted = store.merge_history_page(key, vec![msg("a", 1, 1), msg("b", 2, 2)], 50);
        assert_eq!(inserted, 0);

        let session = store.get(&key).unwrap();
        let seqs: Vec<i64> = session.messages.iter().map(|m| m.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert!(session.is_history_loaded);
        // 页不足 limit，判定到底
        assert!(session.is_history_all_loaded);
    }

    #[test]
    fn test_full_page_not_all_loaded() {
        let key = key_for(500, ConversationType::Group);
        let mut store = SessionStore::new();
        let page: Vec<ChatMessage> = (0..50).map(|i| msg(&format!("m{}", i), 1, i)).collect();
        store.merge_history_page(key, page, 50);
        let session = store.get(&key).unwrap();
        assert!(session.is_history_loaded);
        assert!(!session.is_history_all_loaded);
    }

    #[test]
    fn test_older_page_merges_before_window() {
        let key = key_for(500, ConversationType::Group);
        let mut store = SessionStore::new();
        let newest: Vec<ChatMessage> = (30..50).map(|i| msg(&format!("m{}", i), 1, i)).collect();
        store.merge_history_page(key, newest, 20);

        let older: Vec<ChatMessage> = (10..30).map(|i| msg(&format!("m{}", i), 1, i)).collect();
        let inserted = store.merge_history_page(key, older, 20);
        assert_eq!(inserted, 20);

        let session = store.get(&key).unwrap();
        assert_eq!(session.messages.first().unwrap().seq, 10);
        assert_eq!(session.messages.last().unwrap().seq, 49);
        assert_eq!(session.messages.len(), 40);
    }

    #[test]
    fn test_append_live_dedup() {
        let key = key_for(500, ConversationType::Group);
        let mut store = SessionStore::new();
        assert!(store.append_live(key, msg("x", 1, 7)));
        assert!(!store.append_live(key, msg("x", 1, 7)));
        // msg_id 缺失时按 (seq, from_user_id) 去重
        let mut anon = msg("y", 1, 7);
        anon.msg_id = None;
        assert!(!store.append_live(key, anon));
        assert_eq!(store.get(&key).unwrap().messages.len(), 1);
    }

    #[test]
    fn test_append_live_out_of_order_resorts() {
        let key = key_for(500, ConversationType::Group);
        let mut store = SessionStore::new();
        store.append_live(key, msg("b", 1, 5));
        store.append_live(key, msg("a", 1, 3));
        let seqs: Vec<i64> = store.get(&key).unwrap().messages.iter().map(|m| m.seq).collect();
        assert_eq!(seqs, vec![3, 5]);
    }
}
