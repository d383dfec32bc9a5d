pub mod im;

// 重新导出常用类型和函数，方便外部使用
pub use im::{
    client::{ChatClient, ClientConfig},
    connection::ConnState,
    conversation::ConversationSummary,
    identity::{ConversationKey, ConversationType},
    listener::{ChatListener, EmptyChatListener},
    login_async,
    types::ChatMessage,
};
