//! # Rover Protocol
//!
//! 协处理器总线协议定义（无硬件依赖）
//!
//! ## 帧格式
//!
//! 命令帧：`[总长度] [序列号] [操作码] [载荷...] [校验和]`
//!
//! - 总长度包含校验和字节本身，最小命令帧为 4 字节（无载荷）
//! - 校验和 = 前面所有字节之和 mod 256
//! - 多字节载荷字段一律使用小端（Intel / LSB）字节序
//!
//! 响应帧：`[应答码] [长度] [回显序列号] [载荷...] [校验和]`
//!
//! - 长度为 3 表示无载荷，此时也没有校验和字节
//! - 序列号按地址在每个被确认的帧之后递增，用于识别过期响应
//!
//! ## 模块
//!
//! - `ops`: 操作码常量定义（fire-and-forget 与请求两段区间）

pub mod ops;

use smallvec::SmallVec;
use thiserror::Error;

/// 应答码：命令已被接受并处理
pub const ACK: u8 = 0x55;
/// 应答码：协处理器忙，稍后重读响应
pub const ACK_RETRY: u8 = 0x56;
/// 应答码：协处理器命令队列已满，本条命令被丢弃
pub const NAK_OVERFLOW: u8 = 0xCD;

/// 命令/响应帧的最大总长度（与协处理器固件的缓冲区一致）
pub const MAX_FRAME_LEN: usize = 30;

/// 响应头长度：`[应答码] [长度] [序列号]`
pub const RESPONSE_HEADER_LEN: usize = 3;

/// 命令载荷缓冲区
///
/// 帧很短（≤ 30 字节），用 SmallVec 保证构帧不触碰堆。
pub type Payload = SmallVec<[u8; 16]>;

/// 协议解析错误类型
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Unknown ack code: 0x{0:02X}")]
    BadAck(u8),

    #[error("Response too short: declared {declared}, buffer {available}")]
    ShortResponse { declared: usize, available: usize },

    #[error("Sequence mismatch: expected {expected}, got {got}")]
    SequenceMismatch { expected: u8, got: u8 },

    #[error("Checksum mismatch: expected 0x{expected:02X}, got 0x{got:02X}")]
    ChecksumMismatch { expected: u8, got: u8 },

    #[error("Payload truncated: need {need} more bytes at offset {offset}")]
    Truncated { offset: usize, need: usize },

    #[error("Frame too long: {len} bytes (max {MAX_FRAME_LEN})")]
    FrameTooLong { len: usize },
}

/// 计算校验和：所有字节之和 mod 256
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |sum, b| sum.wrapping_add(*b))
}

/// 一条尚未密封的命令帧
///
/// 序列号由总线消费线程在发送时分配，因此构帧分两步：
/// 资源层用链式 `u8()`/`i16()`/... 填充载荷，
/// 消费线程再用 [`CommandFrame::encode`] 注入序列号并封上校验和。
///
/// # Example
///
/// ```
/// use rover_protocol::{CommandFrame, ops};
///
/// let frame = CommandFrame::new(ops::SET_MOTOR).u8(2).i16(-250);
/// let bytes = frame.encode(7).unwrap();
/// assert_eq!(bytes[0] as usize, bytes.len()); // 总长度
/// assert_eq!(bytes[1], 7); // 序列号
/// assert_eq!(bytes[2], ops::SET_MOTOR);
/// ```
#[derive(Debug, Clone)]
pub struct CommandFrame {
    opcode: u8,
    payload: Payload,
}

impl CommandFrame {
    pub fn new(opcode: u8) -> Self {
        Self {
            opcode,
            payload: Payload::new(),
        }
    }

    pub fn opcode(&self) -> u8 {
        self.opcode
    }

    pub fn u8(mut self, value: u8) -> Self {
        self.payload.push(value);
        self
    }

    pub fn i16(mut self, value: i16) -> Self {
        self.payload.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn i32(mut self, value: i32) -> Self {
        self.payload.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn f32(mut self, value: f32) -> Self {
        self.payload.extend_from_slice(&value.to_le_bytes());
        self
    }

    /// 密封帧：注入序列号，前置长度字节，追加校验和
    pub fn encode(&self, seq: u8) -> Result<SmallVec<[u8; 24]>, ProtocolError> {
        // 长度 = 3 字节头 + 载荷 + 1 字节校验和
        let total = RESPONSE_HEADER_LEN + self.payload.len() + 1;
        if total > MAX_FRAME_LEN {
            return Err(ProtocolError::FrameTooLong { len: total });
        }

        let mut bytes = SmallVec::<[u8; 24]>::new();
        bytes.push(total as u8);
        bytes.push(seq);
        bytes.push(self.opcode);
        bytes.extend_from_slice(&self.payload);
        bytes.push(checksum(&bytes));
        Ok(bytes)
    }
}

/// 响应解析结果
///
/// `Busy` 与 `Rejected` 是协处理器的合法应答而非协议违例，
/// 由总线引擎分别映射到读重试和立即放弃。
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseStatus {
    /// 命令已处理，载荷就绪
    Ready(Response),
    /// 协处理器还没准备好响应，应重读
    Busy,
    /// 协处理器命令队列已满，命令被丢弃
    Rejected,
}

/// 一条已校验的响应载荷（头部与校验和已剥离）
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Response {
    data: Payload,
}

impl Response {
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// 获取小端字段读取游标
    pub fn reader(&self) -> ByteReader<'_> {
        ByteReader {
            buf: &self.data,
            pos: 0,
        }
    }
}

/// 解析并校验一条响应帧
///
/// `buf` 是从传输层读到的原始字节（至少应答码一个字节）。
/// 校验顺序：应答码 → 声明长度 → 回显序列号 → 校验和。
/// 校验和只在有载荷时存在（声明长度 > 3）。
pub fn parse_response(buf: &[u8], expected_seq: u8) -> Result<ResponseStatus, ProtocolError> {
    let ack = *buf.first().ok_or(ProtocolError::ShortResponse {
        declared: 1,
        available: 0,
    })?;

    match ack {
        ACK => {}
        ACK_RETRY => return Ok(ResponseStatus::Busy),
        NAK_OVERFLOW => return Ok(ResponseStatus::Rejected),
        other => return Err(ProtocolError::BadAck(other)),
    }

    if buf.len() < RESPONSE_HEADER_LEN {
        return Err(ProtocolError::ShortResponse {
            declared: RESPONSE_HEADER_LEN,
            available: buf.len(),
        });
    }

    let declared = buf[1] as usize;
    if declared < RESPONSE_HEADER_LEN || declared > buf.len() {
        return Err(ProtocolError::ShortResponse {
            declared,
            available: buf.len(),
        });
    }

    if buf[2] != expected_seq {
        return Err(ProtocolError::SequenceMismatch {
            expected: expected_seq,
            got: buf[2],
        });
    }

    if declared == RESPONSE_HEADER_LEN {
        // 无载荷帧不携带校验和
        return Ok(ResponseStatus::Ready(Response::default()));
    }

    let expected = checksum(&buf[..declared - 1]);
    let got = buf[declared - 1];
    if expected != got {
        return Err(ProtocolError::ChecksumMismatch { expected, got });
    }

    Ok(ResponseStatus::Ready(Response {
        data: Payload::from_slice(&buf[RESPONSE_HEADER_LEN..declared - 1]),
    }))
}

/// 小端字段读取游标
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn take<const N: usize>(&mut self) -> Result<[u8; N], ProtocolError> {
        let end = self.pos + N;
        if end > self.buf.len() {
            return Err(ProtocolError::Truncated {
                offset: self.pos,
                need: end - self.buf.len(),
            });
        }
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[self.pos..end]);
        self.pos = end;
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take::<1>()?[0])
    }

    pub fn i16(&mut self) -> Result<i16, ProtocolError> {
        Ok(i16::from_le_bytes(self.take::<2>()?))
    }

    pub fn i32(&mut self) -> Result<i32, ProtocolError> {
        Ok(i32::from_le_bytes(self.take::<4>()?))
    }

    pub fn i64(&mut self) -> Result<i64, ProtocolError> {
        Ok(i64::from_le_bytes(self.take::<8>()?))
    }

    pub fn u64(&mut self) -> Result<u64, ProtocolError> {
        Ok(u64::from_le_bytes(self.take::<8>()?))
    }

    pub fn f32(&mut self) -> Result<f32, ProtocolError> {
        Ok(f32::from_le_bytes(self.take::<4>()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 按协处理器固件的格式手工构造一条成功响应
    fn make_response(seq: u8, payload: &[u8]) -> Vec<u8> {
        let mut buf = vec![ACK, 0, seq];
        buf.extend_from_slice(payload);
        if !payload.is_empty() {
            buf[1] = (RESPONSE_HEADER_LEN + payload.len() + 1) as u8;
            buf.push(checksum(&buf));
        } else {
            buf[1] = RESPONSE_HEADER_LEN as u8;
        }
        buf
    }

    #[test]
    fn test_checksum_is_sum_mod_256() {
        assert_eq!(checksum(&[]), 0);
        assert_eq!(checksum(&[1, 2, 3]), 6);
        assert_eq!(checksum(&[0xFF, 0x02]), 0x01);
    }

    #[test]
    fn test_encode_layout() {
        let bytes = CommandFrame::new(ops::SET_MOTOR).u8(1).i16(-500).encode(9).unwrap();

        assert_eq!(bytes.len(), 7);
        assert_eq!(bytes[0], 7); // 总长度
        assert_eq!(bytes[1], 9); // 序列号
        assert_eq!(bytes[2], ops::SET_MOTOR);
        assert_eq!(bytes[3], 1);
        assert_eq!(&bytes[4..6], &(-500i16).to_le_bytes());
        assert_eq!(bytes[6], checksum(&bytes[..6]));
    }

    #[test]
    fn test_encode_empty_payload() {
        let bytes = CommandFrame::new(ops::KEEP_ALIVE).encode(0).unwrap();
        assert_eq!(bytes.len(), 4);
        assert_eq!(bytes[0], 4);
    }

    #[test]
    fn test_encode_rejects_oversize() {
        let mut frame = CommandFrame::new(ops::RESET_NAVIGATOR);
        for _ in 0..8 {
            frame = frame.i32(0);
        }
        assert!(matches!(
            frame.encode(0),
            Err(ProtocolError::FrameTooLong { .. })
        ));
    }

    #[test]
    fn test_checksum_roundtrip_and_corruption() {
        let bytes = CommandFrame::new(ops::CONFIGURE_ENCODER)
            .u8(0)
            .u8(1)
            .u8(3)
            .u8(4)
            .encode(2)
            .unwrap();
        let body_len = bytes.len() - 1;
        assert_eq!(bytes[body_len], checksum(&bytes[..body_len]));

        // 破坏任意一个载荷字节都必须导致校验失败
        for i in 0..body_len {
            let mut corrupted = bytes.clone();
            corrupted[i] ^= 0x40;
            assert_ne!(
                corrupted[body_len],
                checksum(&corrupted[..body_len]),
                "corruption at byte {} not detected",
                i
            );
        }
    }

    #[test]
    fn test_parse_ready_with_payload() {
        let buf = make_response(5, &0x1234_5678i32.to_le_bytes());
        let status = parse_response(&buf, 5).unwrap();
        let ResponseStatus::Ready(resp) = status else {
            panic!("expected Ready, got {:?}", status);
        };
        assert_eq!(resp.reader().i32().unwrap(), 0x1234_5678);
    }

    #[test]
    fn test_parse_ready_empty() {
        let buf = make_response(0, &[]);
        let status = parse_response(&buf, 0).unwrap();
        assert!(matches!(status, ResponseStatus::Ready(r) if r.is_empty()));
    }

    #[test]
    fn test_parse_busy_and_rejected() {
        assert_eq!(
            parse_response(&[ACK_RETRY, 0, 0, 0], 0).unwrap(),
            ResponseStatus::Busy
        );
        assert_eq!(
            parse_response(&[NAK_OVERFLOW, 0, 0, 0], 0).unwrap(),
            ResponseStatus::Rejected
        );
    }

    #[test]
    fn test_parse_bad_ack() {
        assert_eq!(
            parse_response(&[0xAA, 0, 0, 0], 0),
            Err(ProtocolError::BadAck(0xAA))
        );
    }

    #[test]
    fn test_parse_sequence_mismatch() {
        let buf = make_response(3, &[1]);
        assert_eq!(
            parse_response(&buf, 4),
            Err(ProtocolError::SequenceMismatch {
                expected: 4,
                got: 3
            })
        );
    }

    #[test]
    fn test_parse_checksum_mismatch() {
        let mut buf = make_response(1, &[0x42, 0x43]);
        let last = buf.len() - 1;
        buf[last] ^= 0xFF;
        assert!(matches!(
            parse_response(&buf, 1),
            Err(ProtocolError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_reader_multi_field() {
        // Navigator 数据帧布局：yaw i32, x i32, y i32, 速度 i16 ×2, 位置 i32 ×2
        let mut payload = Vec::new();
        payload.extend_from_slice(&(-9000i32).to_le_bytes());
        payload.extend_from_slice(&120i32.to_le_bytes());
        payload.extend_from_slice(&(-40i32).to_le_bytes());
        payload.extend_from_slice(&300i16.to_le_bytes());
        payload.extend_from_slice(&(-300i16).to_le_bytes());
        payload.extend_from_slice(&1000i32.to_le_bytes());
        payload.extend_from_slice(&2000i32.to_le_bytes());

        let buf = make_response(0, &payload);
        let ResponseStatus::Ready(resp) = parse_response(&buf, 0).unwrap() else {
            panic!("expected Ready");
        };
        let mut r = resp.reader();
        assert_eq!(r.i32().unwrap(), -9000);
        assert_eq!(r.i32().unwrap(), 120);
        assert_eq!(r.i32().unwrap(), -40);
        assert_eq!(r.i16().unwrap(), 300);
        assert_eq!(r.i16().unwrap(), -300);
        assert_eq!(r.i32().unwrap(), 1000);
        assert_eq!(r.i32().unwrap(), 2000);
        assert!(r.u8().is_err());
    }

    #[test]
    fn test_reader_truncated() {
        let resp = Response {
            data: Payload::from_slice(&[1, 2]),
        };
        let mut r = resp.reader();
        assert!(matches!(
            r.i32(),
            Err(ProtocolError::Truncated { offset: 0, need: 2 })
        ));
    }
}
