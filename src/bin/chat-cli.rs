//! 聊天 CLI 客户端（测试版）
//!
//! 非交互式 CLI，用于测试和展示聊天功能
//! 启动时通过命令行参数指定账号，自动登录连接，只展示接收到的信息

use anyhow::Result;
use clap::Parser;
use goim_chat_sdk_rust::im::client::{ChatClient, ClientConfig};
use goim_chat_sdk_rust::im::conversation::ConversationSummary;
use goim_chat_sdk_rust::im::listener::ChatListener;
use goim_chat_sdk_rust::im::types::ChatMessage;
use goim_chat_sdk_rust::login_async;
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::{error, info};

/// 聊天 CLI 客户端
#[derive(Parser, Debug)]
#[command(name = "chat-cli")]
#[command(about = "聊天 CLI 客户端 - 用于测试和展示聊天功能", long_about = None)]
struct Args {
    /// 用户名
    #[arg(short, long, default_value = "alice")]
    username: String,

    /// 密码
    #[arg(short, long, default_value = "123456")]
    password: String,

    /// REST 接口前缀
    #[arg(long, default_value = "http://localhost:3112/api")]
    api_base_url: String,

    /// 推送网关地址
    #[arg(long, default_value = "ws://localhost:3102/sub")]
    ws_url: String,

    /// 运行时长（秒），0 表示持续运行
    #[arg(short, long, default_value = "0")]
    duration: u64,

    /// 日志级别（默认: info,goim_chat_sdk_rust=debug）
    #[arg(long, default_value = "info,goim_chat_sdk_rust=debug")]
    log_level: String,
}

/// 初始化日志（同时输出到 stdout 和文件）
fn init_logger(log_level: &str) {
    use std::fs::OpenOptions;
    use std::io;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    // 优先使用环境变量 RUST_LOG（如果设置了），否则使用命令行参数
    let filter_layer =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    // 创建日志文件（追加模式）
    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open("debug.log")
        .expect("无法创建日志文件 debug.log");

    // 输出到 stdout（控制台），保留 ANSI 颜色代码用于终端显示
    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stdout)
        .with_file(true)
        .with_line_number(true)
        .with_target(false)
        .with_ansi(true);

    // 输出到文件，禁用 ANSI 颜色代码（文件不需要颜色）
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_file(true)
        .with_line_number(true)
        .with_target(false)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    info!("[CLI] 📝 日志已同时输出到控制台和文件: debug.log");
}

/// 监听器：输出所有接收到的信息
struct CliListener;

#[async_trait::async_trait]
impl ChatListener for CliListener {
    async fn on_connection_status_changed(&self, connected: bool, detail: String) {
        if connected {
            info!("[CLI] 🔗 已连接: {}", detail);
        } else {
            error!("[CLI] 🔗 连接状态: {}", detail);
        }
    }

    async fn on_recv_new_message(&self, message: ChatMessage) {
        info!(
            "[CLI] 📨 收到新消息: 会话={} 来自={} 内容={}",
            message.conversation_id, message.from_user_id, message.content
        );
    }

    async fn on_conversation_changed(&self, conversations: Vec<ConversationSummary>) {
        info!("[CLI] 🔄 会话变更（共 {} 个）", conversations.len());
    }

    async fn on_new_conversation(&self, conversation: ConversationSummary) {
        info!(
            "[CLI] 🆕 新会话: {} | 最新: {}",
            conversation.key, conversation.last_content
        );
    }

    async fn on_total_unread_count_changed(&self, total: i64) {
        info!("[CLI] 📬 总未读数: {}", total);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 初始化日志
    init_logger(&args.log_level);

    info!("[CLI] 🚀 聊天 CLI 客户端（测试模式）");
    info!("[CLI] 👤 用户名: {}", args.username);
    info!("[CLI] ⏱️  运行时长: {} 秒（0=持续运行）", args.duration);

    // 登录
    let login_data = login_async(&args.api_base_url, &args.username, &args.password).await?;
    info!("[CLI] ✅ 登录成功！用户ID: {}", login_data.user_id);

    // 创建客户端并连接
    let mut config = ClientConfig::new(login_data.user_id, &login_data.token);
    config.api_base_url = args.api_base_url.clone();
    config.ws_url = args.ws_url.clone();
    let client = ChatClient::with_listener(config, Arc::new(CliListener))?;

    info!("[CLI] 🔗 正在连接服务器...");
    client.connect().await?;
    info!("[CLI] ✅ 连接成功！");

    // 显示初始信息
    if let Ok(conversations) = client.conversation_list().await {
        info!("[CLI] 📋 会话列表（共 {} 个）:", conversations.len());
        for conv in conversations.iter().take(5) {
            info!(
                "[CLI]   - {} | 未读: {} | 最新: {}",
                if conv.name.is_empty() {
                    conv.key.to_string()
                } else {
                    conv.name.clone()
                },
                conv.unread_count,
                conv.last_content.chars().take(30).collect::<String>()
            );
        }
    }
    if let Ok(unread) = client.total_unread().await {
        info!("[CLI] 📬 总未读数: {}", unread);
    }

    info!("[CLI] 📥 开始监听消息...");
    if args.duration > 0 {
        info!("[CLI] ⏰ {} 秒后自动退出", args.duration);
        sleep(Duration::from_secs(args.duration)).await;
    } else {
        info!("[CLI] ⏰ 持续运行中，按 Ctrl+C 退出");
        tokio::signal::ctrl_c().await?;
    }

    client.disconnect().await;
    info!("[CLI] 👋 程序退出");
    Ok(())
}
