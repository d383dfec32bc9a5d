//! goim 二进制帧编解码
//!
//! 推送通道上的每一帧都是固定 16 字节头 + body 的二进制包，
//! 所有整数字段均为大端（网络字节序）：
//!
//! ```text
//! offset 0  u32 packLen   = 16 + body 长度
//! offset 4  u16 headerLen = 16
//! offset 6  u16 ver       = 102
//! offset 8  u32 op        操作码
//! offset 12 u32 seq       客户端自增序号，部分回复帧会回显
//! offset 16 body          UTF-8 JSON 或原始字符串
//! ```

use thiserror::Error;

/// 协议版本号
pub const PROTOCOL_VERSION: u16 = 102;

/// 固定头长度（字节）
pub const HEADER_SIZE: u16 = 16;

/// 帧操作码
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    /// 心跳
    Heartbeat,
    /// 心跳回复（仅作活性信号，无 body）
    HeartbeatReply,
    /// 单条消息推送
    MessagePush,
    /// 认证
    Auth,
    /// 认证回复
    AuthReply,
    /// 批量消息推送（房间广播）
    MessagePushBatch,
    /// 加入/切换房间
    ChangeRoom,
    /// 加入/切换房间回复（body 为房间 ID 字符串）
    ChangeRoomReply,
    /// 未识别的操作码，保留原始值（连接层记录日志后丢弃）
    Unknown(u32),
}

impl Opcode {
    /// 从原始操作码构造
    pub fn from_u32(op: u32) -> Self {
        match op {
            2 => Opcode::Heartbeat,
            3 => Opcode::HeartbeatReply,
            5 => Opcode::MessagePush,
            7 => Opcode::Auth,
            8 => Opcode::AuthReply,
            9 => Opcode::MessagePushBatch,
            12 => Opcode::ChangeRoom,
            13 => Opcode::ChangeRoomReply,
            other => Opcode::Unknown(other),
        }
    }

    /// 转换为线上原始值
    pub fn as_u32(self) -> u32 {
        match self {
            Opcode::Heartbeat => 2,
            Opcode::HeartbeatReply => 3,
            Opcode::MessagePush => 5,
            Opcode::Auth => 7,
            Opcode::AuthReply => 8,
            Opcode::MessagePushBatch => 9,
            Opcode::ChangeRoom => 12,
            Opcode::ChangeRoomReply => 13,
            Opcode::Unknown(other) => other,
        }
    }

    /// 操作码名称（日志用）
    pub fn name(self) -> &'static str {
        match self {
            Opcode::Heartbeat => "Heartbeat",
            Opcode::HeartbeatReply => "HeartbeatReply",
            Opcode::MessagePush => "MessagePush",
            Opcode::Auth => "Auth",
            Opcode::AuthReply => "AuthReply",
            Opcode::MessagePushBatch => "MessagePushBatch",
            Opcode::ChangeRoom => "ChangeRoom",
            Opcode::ChangeRoomReply => "ChangeRoomReply",
            Opcode::Unknown(_) => "Unknown",
        }
    }
}

/// 解码错误
///
/// 编解码失败只丢弃当前帧，不触发断线。
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    /// 数据不足一个完整帧头
    #[error("帧数据不完整: 需要至少 {HEADER_SIZE} 字节，实际 {actual} 字节")]
    Truncated {
        /// 实际收到的字节数
        actual: usize,
    },
    /// headerLen 字段与协议规定的固定帧头长度不符
    #[error("帧头长度非法: 期望 {HEADER_SIZE}，实际 {actual}")]
    BadHeader {
        /// 帧里声明的 headerLen
        actual: usize,
    },
    /// packLen 声明的 body 长度与实际可用数据不符
    #[error("帧长度不匹配: packLen 声明 body {declared} 字节，实际 {actual} 字节")]
    LengthMismatch {
        /// packLen - headerLen
        declared: usize,
        /// 头部之后实际剩余的字节数
        actual: usize,
    },
}

/// 一个完整的协议帧
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub ver: u16,
    pub op: Opcode,
    pub seq: u32,
    pub body: Vec<u8>,
}

impl Frame {
    /// body 按 UTF-8 解释（推送 body 均为 JSON 或原始字符串）
    pub fn body_text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

/// 编码一帧，body 为空是合法的（心跳帧没有 body）
pub fn encode(ver: u16, op: Opcode, seq: u32, body: &[u8]) -> Vec<u8> {
    let pack_len = HEADER_SIZE as u32 + body.len() as u32;
    let mut buf = Vec::with_capacity(pack_len as usize);
    buf.extend_from_slice(&pack_len.to_be_bytes());
    buf.extend_from_slice(&HEADER_SIZE.to_be_bytes());
    buf.extend_from_slice(&ver.to_be_bytes());
    buf.extend_from_slice(&op.as_u32().to_be_bytes());
    buf.extend_from_slice(&seq.to_be_bytes());
    buf.extend_from_slice(body);
    buf
}

/// 解码一帧，要求 `data` 恰好包含一个完整帧
pub fn decode(data: &[u8]) -> Result<Frame, CodecError> {
    if data.len() < HEADER_SIZE as usize {
        return Err(CodecError::Truncated { actual: data.len() });
    }

    let pack_len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
    let header_len = u16::from_be_bytes([data[4], data[5]]) as usize;
    let ver = u16::from_be_bytes([data[6], data[7]]);
    let op = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);
    let seq = u32::from_be_bytes([data[12], data[13], data[14], data[15]]);

    // 帧头长度是协议常量，不信任线上的声明值
    if header_len != HEADER_SIZE as usize {
        return Err(CodecError::BadHeader { actual: header_len });
    }

    let declared = pack_len.saturating_sub(header_len);
    let actual = data.len() - header_len;
    if declared != actual {
        return Err(CodecError::LengthMismatch { declared, actual });
    }

    Ok(Frame {
        ver,
        op: Opcode::from_u32(op),
        seq,
        body: data[header_len..].to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_header_layout() {
        let buf = encode(PROTOCOL_VERSION, Opcode::Auth, 1, b"{}");
        assert_eq!(buf.len(), 18);
        // packLen = 18
        assert_eq!(&buf[0..4], &[0, 0, 0, 18]);
        // headerLen = 16
        assert_eq!(&buf[4..6], &[0, 16]);
        // ver = 102
        assert_eq!(&buf[6..8], &[0, 102]);
        // op = 7 (AUTH)
        assert_eq!(&buf[8..12], &[0, 0, 0, 7]);
        // seq = 1
        assert_eq!(&buf[12..16], &[0, 0, 0, 1]);
        assert_eq!(&buf[16..], b"{}");
    }

    #[test]
    fn test_round_trip() {
        let cases: Vec<(u16, Opcode, u32, Vec<u8>)> = vec![
            (PROTOCOL_VERSION, Opcode::Heartbeat, 42, Vec::new()),
            (PROTOCOL_VERSION, Opcode::Auth, 1, br#"{"mid":9001}"#.to_vec()),
            (PROTOCOL_VERSION, Opcode::MessagePushBatch, 7, vec![0, 1, 2, 255]),
            (1, Opcode::Unknown(999), u32::MAX, b"x".to_vec()),
        ];
        for (ver, op, seq, body) in cases {
            let frame = decode(&encode(ver, op, seq, &body)).unwrap();
            assert_eq!(frame.ver, ver);
            assert_eq!(frame.op, op);
            assert_eq!(frame.seq, seq);
            assert_eq!(frame.body, body);
        }
    }

    #[test]
    fn test_empty_body_is_valid() {
        let frame = decode(&encode(PROTOCOL_VERSION, Opcode::Heartbeat, 3, &[])).unwrap();
        assert_eq!(frame.op, Opcode::Heartbeat);
        assert!(frame.body.is_empty());
    }

    #[test]
    fn test_truncated() {
        let err = decode(&[0u8; 15]).unwrap_err();
        assert_eq!(err, CodecError::Truncated { actual: 15 });
        assert_eq!(decode(&[]).unwrap_err(), CodecError::Truncated { actual: 0 });
    }

    #[test]
    fn test_length_mismatch() {
        // packLen 声明 4 字节 body，实际只有 2 字节
        let mut buf = encode(PROTOCOL_VERSION, Opcode::MessagePush, 1, b"abcd");
        buf.truncate(18);
        let err = decode(&buf).unwrap_err();
        assert_eq!(err, CodecError::LengthMismatch { declared: 4, actual: 2 });

        // 反向：实际 body 多于声明
        let mut buf = encode(PROTOCOL_VERSION, Opcode::MessagePush, 1, b"ab");
        buf.extend_from_slice(b"zz");
        assert!(matches!(decode(&buf), Err(CodecError::LengthMismatch { .. })));
    }

    #[test]
    fn test_bad_header_len_rejected() {
        // headerLen=0 且 packLen 自洽的伪造帧不能把帧头折进 body
        let mut buf = encode(PROTOCOL_VERSION, Opcode::MessagePush, 1, b"{}");
        buf[4] = 0;
        buf[5] = 0;
        assert_eq!(
            decode(&buf).unwrap_err(),
            CodecError::BadHeader { actual: 0 }
        );

        let mut buf = encode(PROTOCOL_VERSION, Opcode::MessagePush, 1, b"{}");
        buf[5] = 20;
        assert_eq!(
            decode(&buf).unwrap_err(),
            CodecError::BadHeader { actual: 20 }
        );
    }

    #[test]
    fn test_unknown_opcode_preserved() {
        let frame = decode(&encode(PROTOCOL_VERSION, Opcode::Unknown(77), 5, &[])).unwrap();
        assert_eq!(frame.op, Opcode::Unknown(77));
        assert_eq!(frame.op.as_u32(), 77);
    }
}
