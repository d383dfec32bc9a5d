//! 推送连接管理
//!
//! 维护到网关的 WebSocket 长连接：认证、心跳、断线重连、收包分发。
//! 收到的推送帧不在读循环里处理，而是投递到调度任务统一合并。

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::im::protocol::{self, Frame, Opcode, PROTOCOL_VERSION};
use crate::im::reconciler::ReconcileCommand;
use crate::im::types::AuthPayload;

/// 心跳间隔
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
/// 断线后的固定重连间隔
const RECONNECT_INTERVAL: Duration = Duration::from_secs(5);

type WsWriter = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;

/// 连接状态机：断开 → 连接中 → 已连接 → 已认证
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connecting,
    Connected,
    Authenticated,
}

struct ConnInner {
    ws_url: String,
    platform: String,
    accepts: Vec<i32>,
    writer: Mutex<Option<WsWriter>>,
    state_tx: watch::Sender<ConnState>,
    /// 帧序号，连接内单调递增
    seq: AtomicU32,
    /// 显式断开后不再重连
    closed: AtomicBool,
    /// 连接任务是否在运行，防止重复 connect 起多条连接
    running: AtomicBool,
    /// 每次成功建链加一，旧连接的心跳任务据此退出
    generation: AtomicU64,
    commands: mpsc::Sender<ReconcileCommand>,
    room_reply: Mutex<Option<oneshot::Sender<String>>>,
}

/// 推送连接管理器，可廉价克隆
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ConnInner>,
    state_rx: watch::Receiver<ConnState>,
}

impl ConnectionManager {
    pub fn new(
        ws_url: &str,
        platform: &str,
        accepts: Vec<i32>,
        commands: mpsc::Sender<ReconcileCommand>,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnState::Disconnected);
        Self {
            inner: Arc::new(ConnInner {
                ws_url: ws_url.to_string(),
                platform: platform.to_string(),
                accepts,
                writer: Mutex::new(None),
                state_tx,
                seq: AtomicU32::new(1),
                closed: AtomicBool::new(false),
                running: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                commands,
                room_reply: Mutex::new(None),
            }),
            state_rx,
        }
    }

    pub fn state(&self) -> ConnState {
        *self.state_rx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnState> {
        self.state_rx.clone()
    }

    /// 建立连接并在后台驻留：断开后每 5 秒重试，直到显式 `disconnect`
    ///
    /// 连接任务已在运行时重复调用是空操作。
    pub fn connect(&self, user_id: i64) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            warn!("[Conn] 连接任务已在运行，忽略重复 connect");
            return;
        }
        self.inner.closed.store(false, Ordering::SeqCst);
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                if manager.inner.closed.load(Ordering::SeqCst) {
                    break;
                }
                if let Err(e) = manager.connect_once(user_id).await {
                    error!("[Conn] 连接中断: {:?}", e);
                }
                manager.on_session_end().await;
                if manager.inner.closed.load(Ordering::SeqCst) {
                    break;
                }
                info!("[Conn] {} 秒后重连...", RECONNECT_INTERVAL.as_secs());
                tokio::time::sleep(RECONNECT_INTERVAL).await;
            }
            manager.inner.running.store(false, Ordering::SeqCst);
            debug!("[Conn] 连接任务退出");
        });
    }

    /// 单次建链：握手、认证、心跳、读循环，返回即本次连接结束
    async fn connect_once(&self, user_id: i64) -> Result<()> {
        self.set_state(ConnState::Connecting).await;
        info!("[Conn] 正在连接 {} ...", self.inner.ws_url);

        let (stream, _) = connect_async(self.inner.ws_url.as_str())
            .await
            .context("WebSocket 握手失败")?;
        let (writer, mut reader) = stream.split();
        {
            let mut guard = self.inner.writer.lock().await;
            *guard = Some(writer);
        }
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.set_state(ConnState::Connected).await;
        info!("[Conn] ✅ WebSocket 已连接");

        // 认证必须先于一切心跳
        let payload = AuthPayload {
            mid: user_id,
            key: format!("user_{}", user_id),
            room_id: String::new(),
            platform: self.inner.platform.clone(),
            accepts: self.inner.accepts.clone(),
        };
        let body = serde_json::to_vec(&payload).context("序列化认证负载失败")?;
        self.send_frame(Opcode::Auth, &body).await?;

        self.spawn_heartbeat(generation);

        while let Some(message) = reader.next().await {
            let message = message.context("读取 WebSocket 消息失败")?;
            match message {
                WsMessage::Binary(data) => match protocol::decode(&data) {
                    Ok(frame) => self.dispatch_frame(frame).await,
                    Err(e) => warn!("[Conn] 丢弃无法解析的帧: {}", e),
                },
                WsMessage::Close(reason) => {
                    info!("[Conn] 对端关闭连接: {:?}", reason);
                    break;
                }
                WsMessage::Ping(_) | WsMessage::Pong(_) => {}
                other => debug!("[Conn] 忽略非二进制消息: {:?}", other),
            }
        }
        Ok(())
    }

    /// 按 opcode 分发一帧
    async fn dispatch_frame(&self, frame: Frame) {
        match frame.op {
            Opcode::AuthReply => {
                info!("[Conn] ✅ 认证通过");
                self.set_state(ConnState::Authenticated).await;
            }
            Opcode::HeartbeatReply => {
                debug!("[Conn] 心跳应答 seq={}", frame.seq);
            }
            Opcode::ChangeRoomReply => {
                let mut guard = self.inner.room_reply.lock().await;
                if let Some(tx) = guard.take() {
                    let _ = tx.send(frame.body_text().into_owned());
                } else {
                    debug!("[Conn] 无人等待的切房应答");
                }
            }
            Opcode::MessagePush | Opcode::MessagePushBatch => {
                if let Err(e) = self
                    .inner
                    .commands
                    .send(ReconcileCommand::Frame(frame))
                    .await
                {
                    error!("[Conn] 投递推送帧失败: {}", e);
                }
            }
            Opcode::Unknown(raw) => {
                warn!("[Conn] 丢弃未知 opcode={} 的帧", raw);
            }
            other => {
                warn!("[Conn] 丢弃不期望的帧 op={}", other.name());
            }
        }
    }

    fn spawn_heartbeat(&self, generation: u64) {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            // interval 的首个 tick 立即到期，认证帧已发出，这里跳过
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if manager.inner.closed.load(Ordering::SeqCst)
                    || manager.inner.generation.load(Ordering::SeqCst) != generation
                {
                    break;
                }
                if let Err(e) = manager.send_frame(Opcode::Heartbeat, &[]).await {
                    warn!("[Conn] 心跳发送失败: {:?}", e);
                    break;
                }
                debug!("[Conn] 💓 心跳已发送");
            }
            debug!("[Conn] 心跳任务退出 generation={}", generation);
        });
    }

    /// 编码并发送一帧，seq 自动递增
    pub async fn send_frame(&self, op: Opcode, body: &[u8]) -> Result<()> {
        let seq = self.inner.seq.fetch_add(1, Ordering::SeqCst);
        let bytes = protocol::encode(PROTOCOL_VERSION, op, seq, body);
        let mut guard = self.inner.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("连接未建立"))?;
        writer
            .send(WsMessage::Binary(bytes))
            .await
            .context("发送帧失败")?;
        Ok(())
    }

    /// 切换房间订阅，等待网关应答并返回应答文本
    pub async fn change_room(&self, room_id: &str) -> Result<String> {
        let (tx, rx) = oneshot::channel();
        {
            let mut guard = self.inner.room_reply.lock().await;
            *guard = Some(tx);
        }
        self.send_frame(Opcode::ChangeRoom, room_id.as_bytes())
            .await?;
        let reply = rx.await.context("等待切房应答时连接关闭")?;
        info!("[Conn] 切房完成: room_id={}, 应答: {}", room_id, reply);
        Ok(reply)
    }

    /// 显式断开，不再重连
    pub async fn disconnect(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        // 旧心跳任务下个 tick 即退出
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        let mut guard = self.inner.writer.lock().await;
        if let Some(mut writer) = guard.take() {
            let _ = writer.send(WsMessage::Close(None)).await;
        }
        drop(guard);
        self.set_state(ConnState::Disconnected).await;
        info!("[Conn] 已断开连接");
    }

    /// 等待进入已认证状态，超时返回错误
    pub async fn await_authenticated(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.state_rx.clone();
        tokio::time::timeout(timeout, async {
            loop {
                if *rx.borrow_and_update() == ConnState::Authenticated {
                    return Ok::<(), anyhow::Error>(());
                }
                rx.changed().await.context("连接管理器已销毁")?;
            }
        })
        .await
        .map_err(|_| anyhow::anyhow!("等待认证超时"))?
    }

    async fn on_session_end(&self) {
        {
            let mut guard = self.inner.writer.lock().await;
            *guard = None;
        }
        if !self.inner.closed.load(Ordering::SeqCst) {
            self.set_state(ConnState::Disconnected).await;
        }
    }

    async fn set_state(&self, state: ConnState) {
        let changed = {
            let prev = *self.inner.state_tx.borrow();
            self.inner.state_tx.send_replace(state);
            prev != state
        };
        if changed {
            let (connected, detail) = match state {
                ConnState::Disconnected => (false, "连接断开".to_string()),
                ConnState::Connecting => (false, "正在连接".to_string()),
                ConnState::Connected => (false, "已连接，等待认证".to_string()),
                ConnState::Authenticated => (true, "认证通过".to_string()),
            };
            let _ = self
                .inner
                .commands
                .send(ReconcileCommand::ConnectionStatus { connected, detail })
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn manager() -> (ConnectionManager, mpsc::Receiver<ReconcileCommand>) {
        let (tx, rx) = mpsc::channel(16);
        (
            ConnectionManager::new("ws://localhost:3102/sub", "web", vec![1001, 1002, 1003], tx),
            rx,
        )
    }

    /// 本地模拟网关：接受 `connections` 条连接，观察到的每帧 opcode
    /// 发到 `observed`，认证帧回 AUTH_REPLY。`drop_after_reply` 为 true
    /// 时应答后立即断开，模拟网关侧异常掉线。
    async fn run_mock_gateway(
        listener: TcpListener,
        observed: mpsc::Sender<Opcode>,
        connections: usize,
        drop_after_reply: bool,
    ) {
        for _ in 0..connections {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                return;
            };
            while let Some(Ok(msg)) = ws.next().await {
                if let WsMessage::Binary(data) = msg {
                    let frame = protocol::decode(&data).unwrap();
                    let _ = observed.send(frame.op).await;
                    if frame.op == Opcode::Auth {
                        let reply = protocol::encode(
                            PROTOCOL_VERSION,
                            Opcode::AuthReply,
                            frame.seq,
                            &[],
                        );
                        ws.send(WsMessage::Binary(reply)).await.unwrap();
                        if drop_after_reply {
                            break;
                        }
                    }
                }
            }
        }
    }

    async fn local_manager(
        capacity: usize,
    ) -> (
        ConnectionManager,
        mpsc::Receiver<ReconcileCommand>,
        TcpListener,
    ) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/sub", listener.local_addr().unwrap());
        let (tx, rx) = mpsc::channel(capacity);
        (
            ConnectionManager::new(&url, "web", vec![1001, 1002, 1003], tx),
            rx,
            listener,
        )
    }

    #[tokio::test]
    async fn test_reconnect_sends_auth_first_on_new_connection() {
        let (conn, mut cmd_rx, listener) = local_manager(64).await;
        let (obs_tx, mut obs_rx) = mpsc::channel(8);
        tokio::spawn(run_mock_gateway(listener, obs_tx, 2, true));

        let started = std::time::Instant::now();
        conn.connect(9001);
        conn.await_authenticated(Duration::from_secs(15))
            .await
            .unwrap();
        assert_eq!(obs_rx.recv().await, Some(Opcode::Auth));

        // 网关掉线后自动重连，新连接的第一帧必须仍是认证帧
        conn.await_authenticated(Duration::from_secs(15))
            .await
            .unwrap();
        assert_eq!(obs_rx.recv().await, Some(Opcode::Auth));
        assert!(started.elapsed() >= RECONNECT_INTERVAL);

        conn.disconnect().await;

        // 中途应有过断线状态上报
        let mut saw_disconnect = false;
        while let Ok(cmd) = cmd_rx.try_recv() {
            if let ReconcileCommand::ConnectionStatus { connected: false, detail } = cmd {
                if detail.contains("断开") {
                    saw_disconnect = true;
                }
            }
        }
        assert!(saw_disconnect);
    }

    #[tokio::test]
    async fn test_connect_twice_spawns_single_connection() {
        let (conn, _cmd_rx, listener) = local_manager(64).await;
        let (obs_tx, mut obs_rx) = mpsc::channel(8);
        tokio::spawn(run_mock_gateway(listener, obs_tx, 2, false));

        conn.connect(9001);
        conn.connect(9001);
        conn.await_authenticated(Duration::from_secs(15))
            .await
            .unwrap();
        assert_eq!(obs_rx.recv().await, Some(Opcode::Auth));

        // 第二次 connect 是空操作，不会再出现第二条连接的认证帧
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(obs_rx.try_recv().is_err());

        conn.disconnect().await;
    }

    #[tokio::test]
    async fn test_send_frame_without_writer_fails() {
        let (conn, _rx) = manager();
        assert!(conn.send_frame(Opcode::Heartbeat, &[]).await.is_err());
    }

    #[tokio::test]
    async fn test_await_authenticated_times_out() {
        let (conn, _rx) = manager();
        let result = conn
            .await_authenticated(Duration::from_millis(20))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_push_frame_routes_to_dispatcher() {
        let (conn, mut rx) = manager();
        let frame = Frame {
            ver: PROTOCOL_VERSION,
            op: Opcode::MessagePush,
            seq: 1,
            body: b"{}".to_vec(),
        };
        conn.dispatch_frame(frame).await;
        match rx.recv().await {
            Some(ReconcileCommand::Frame(f)) => assert_eq!(f.op, Opcode::MessagePush),
            other => panic!("期望推送帧被投递，实际 {:?}", other.is_some()),
        }
    }

    #[tokio::test]
    async fn test_auth_reply_advances_state() {
        let (conn, mut rx) = manager();
        let frame = Frame {
            ver: PROTOCOL_VERSION,
            op: Opcode::AuthReply,
            seq: 1,
            body: Vec::new(),
        };
        conn.dispatch_frame(frame).await;
        assert_eq!(conn.state(), ConnState::Authenticated);
        // 状态变化同样走调度队列
        match rx.recv().await {
            Some(ReconcileCommand::ConnectionStatus { connected, .. }) => assert!(connected),
            _ => panic!("期望连接状态事件"),
        }
    }
}
