pub mod api;
pub mod auth;
pub mod client;
pub mod connection;
pub mod conversation;
pub mod identity;
pub mod listener;
pub mod protocol;
pub mod reconciler;
pub mod session;
pub mod types;

// 重新导出认证相关函数
pub use auth::login_async;

// 重新导出客户端常用类型
pub use client::{ChatClient, ClientConfig};
pub use connection::ConnState;
pub use conversation::ConversationSummary;
pub use identity::{ConversationKey, ConversationType};
pub use listener::{ChatListener, EmptyChatListener};
pub use types::ChatMessage;
