use byteorder::{ByteOrder, LittleEndian};
use rkyv::{Archive, Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::error::{Error, Result};
use crate::{config::ForwardConfig, rpc::aligned};

pub const PROTOCOL_VERSION: u16 = 1;

/// prefix | len (u32 LE)
pub const FRAME_HEADER_LEN: usize = 1 + 4;

/// Frame prefix is 8 bits. The first bit specifies whether the frame carries
/// a subtree the receiver must forward to. The second bit specifies whether
/// the body is zstd compressed. The last 6 bits specify the frame type.
///
/// - `forwarded` => the receiver is an intermediate hop and has to run its
///   own dispatch before replying
/// - `!forwarded` => the receiver is a leaf and only answers for itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramePrefix(u8);

impl FramePrefix {
    pub fn new(forwarded: bool, compressed: bool, frame_type: FrameType) -> Self {
        let mut prefix = 0b0000_0000;
        if forwarded {
            prefix |= 0b1000_0000;
        }
        if compressed {
            prefix |= 0b0100_0000;
        }
        prefix |= frame_type as u8;
        Self(prefix)
    }

    pub fn forwarded(&self) -> bool {
        self.0 & 0b1000_0000 != 0
    }

    pub fn compressed(&self) -> bool {
        self.0 & 0b0100_0000 != 0
    }

    pub fn frame_type(&self) -> Result<FrameType> {
        FrameType::try_from(self.0 & 0b0011_1111)
    }

    pub fn byte(&self) -> u8 {
        self.0
    }
}

impl From<u8> for FramePrefix {
    fn from(byte: u8) -> Self {
        Self(byte)
    }
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameType {
    /// A request travelling down the tree
    Forward = 1,
    /// A bundle of per-node results travelling back up
    Reply = 2,
}

impl TryFrom<u8> for FrameType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(FrameType::Forward),
            2 => Ok(FrameType::Reply),
            other => Err(Error::UnknownFrameType(other)),
        }
    }
}

/// One node of a subtree descriptor. `span` is the size of the subtree
/// rooted at this node, itself included, so a flat preorder list of these
/// describes the whole shape.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct WireNode {
    pub name: String,
    pub addr: String,
    pub span: u32,
}

#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct WireAlias {
    pub name: String,
    pub addr: String,
}

/// Everything a hop needs to answer for itself and forward to its subtree.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct ForwardHeader {
    pub version: u16,
    pub dispatch_id: u64,
    /// The name the sender knows the receiver by. The receiver reports its
    /// own result under this name.
    pub target: String,
    /// Budget for the receiver, already reduced by the sender's per-hop
    /// overhead.
    pub timeout_us: u64,
    pub subtree: Vec<WireNode>,
    pub aliases: Vec<WireAlias>,
    /// Microseconds since the epoch after which `aliases` must be ignored.
    pub aliases_expire_at: Option<i64>,
    /// The archived request.
    pub request: Vec<u8>,
}

#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct WireEntry {
    pub node: String,
    pub error: u16,
    pub return_code: i32,
    /// The archived reply, empty for failures.
    pub body: Vec<u8>,
}

#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct ReplyBundle {
    pub version: u16,
    pub dispatch_id: u64,
    pub entries: Vec<WireEntry>,
}

/// Seals archived headers and bundles into length-prefixed frames and opens
/// them again.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_len: usize,
    compress_threshold: usize,
}

impl FrameCodec {
    pub fn new(max_frame_len: usize, compress_threshold: usize) -> Self {
        Self {
            max_frame_len,
            compress_threshold,
        }
    }

    pub fn from_config(config: &ForwardConfig) -> Self {
        Self::new(config.max_frame_len, config.compress_threshold)
    }

    pub fn encode_forward(&self, header: &ForwardHeader) -> Result<Vec<u8>> {
        let body = rkyv::to_bytes::<_, 1024>(header)
            .map_err(|e| Error::Encode(format!("forward header: {:?}", e)))?;
        self.seal(FrameType::Forward, !header.subtree.is_empty(), &body)
    }

    pub fn encode_reply(&self, bundle: &ReplyBundle) -> Result<Vec<u8>> {
        let body = rkyv::to_bytes::<_, 1024>(bundle)
            .map_err(|e| Error::Encode(format!("reply bundle: {:?}", e)))?;
        self.seal(FrameType::Reply, false, &body)
    }

    pub fn decode_forward(&self, frame: &[u8]) -> Result<ForwardHeader> {
        let body = self.open(frame, FrameType::Forward)?;
        let header = rkyv::from_bytes::<ForwardHeader>(&aligned(&body))
            .map_err(|_| Error::Decode("forward header"))?;
        if header.version != PROTOCOL_VERSION {
            return Err(Error::UnsupportedVersion(header.version));
        }
        // open() already checked the frame holds a prefix
        if FramePrefix::from(frame[0]).forwarded() == header.subtree.is_empty() {
            return Err(Error::Decode("forwarded flag disagrees with subtree"));
        }
        Ok(header)
    }

    pub fn decode_reply(&self, frame: &[u8]) -> Result<ReplyBundle> {
        let body = self.open(frame, FrameType::Reply)?;
        let bundle = rkyv::from_bytes::<ReplyBundle>(&aligned(&body))
            .map_err(|_| Error::Decode("reply bundle"))?;
        if bundle.version != PROTOCOL_VERSION {
            return Err(Error::UnsupportedVersion(bundle.version));
        }
        Ok(bundle)
    }

    fn seal(&self, frame_type: FrameType, forwarded: bool, body: &[u8]) -> Result<Vec<u8>> {
        let compressed = body.len() > self.compress_threshold;
        let compressed_body;
        let body = if compressed {
            compressed_body = zstd::bulk::compress(body, 0)?;
            &compressed_body[..]
        } else {
            body
        };
        if body.len() > self.max_frame_len {
            return Err(Error::FrameTooLarge(body.len()));
        }
        let len = u32::try_from(body.len()).map_err(|_| Error::FrameTooLarge(body.len()))?;

        let prefix = FramePrefix::new(forwarded, compressed, frame_type);
        let mut frame = vec![0u8; FRAME_HEADER_LEN + body.len()];
        frame[0] = prefix.byte();
        LittleEndian::write_u32(&mut frame[1..FRAME_HEADER_LEN], len);
        frame[FRAME_HEADER_LEN..].copy_from_slice(body);
        Ok(frame)
    }

    /// Checks the frame against `expected` and returns the plain body.
    fn open(&self, frame: &[u8], expected: FrameType) -> Result<Vec<u8>> {
        if frame.len() < FRAME_HEADER_LEN {
            return Err(Error::Decode("truncated frame"));
        }
        let prefix = FramePrefix::from(frame[0]);
        if prefix.frame_type()? != expected {
            return Err(Error::Decode("unexpected frame type"));
        }
        let len = LittleEndian::read_u32(&frame[1..FRAME_HEADER_LEN]) as usize;
        let body = &frame[FRAME_HEADER_LEN..];
        if body.len() != len {
            return Err(Error::Decode("frame length mismatch"));
        }
        if prefix.compressed() {
            zstd::bulk::decompress(body, self.max_frame_len)
                .map_err(|_| Error::Decode("compressed frame body"))
        } else {
            Ok(body.to_vec())
        }
    }

    /// Reads one whole frame, prefix and length included.
    pub async fn read_frame<R>(&self, reader: &mut R) -> Result<Vec<u8>>
    where
        R: AsyncRead + Unpin,
    {
        let mut head = [0u8; FRAME_HEADER_LEN];
        reader.read_exact(&mut head).await?;
        let len = LittleEndian::read_u32(&head[1..]) as usize;
        if len > self.max_frame_len {
            return Err(Error::FrameTooLarge(len));
        }
        let mut frame = vec![0u8; FRAME_HEADER_LEN + len];
        frame[..FRAME_HEADER_LEN].copy_from_slice(&head);
        reader.read_exact(&mut frame[FRAME_HEADER_LEN..]).await?;
        Ok(frame)
    }

    pub async fn write_frame<W>(&self, writer: &mut W, frame: &[u8]) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        writer.write_all(frame).await?;
        writer.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(subtree: Vec<WireNode>) -> ForwardHeader {
        ForwardHeader {
            version: PROTOCOL_VERSION,
            dispatch_id: 0xfeed,
            target: "cn001".into(),
            timeout_us: 90_000,
            subtree,
            aliases: vec![],
            aliases_expire_at: None,
            request: vec![],
        }
    }

    #[test]
    fn prefix_bits() {
        let prefix = FramePrefix::new(true, false, FrameType::Reply);
        assert!(prefix.forwarded());
        assert!(!prefix.compressed());
        assert_eq!(prefix.frame_type().unwrap(), FrameType::Reply);
        assert!(FramePrefix::from(0b0011_1111).frame_type().is_err());
    }

    #[test]
    fn large_subtree_is_compressed_and_flagged_forwarded() {
        let codec = FrameCodec::new(1 << 20, 512);
        let subtree = (0..200)
            .map(|i| WireNode {
                name: format!("cn{:03}", i),
                addr: format!("10.1.0.{}:6818", i),
                span: 1,
            })
            .collect::<Vec<_>>();
        let original = header(subtree);
        let frame = codec.encode_forward(&original).unwrap();
        let prefix = FramePrefix::from(frame[0]);
        assert!(prefix.forwarded());
        assert!(prefix.compressed());
        assert_eq!(codec.decode_forward(&frame).unwrap(), original);
    }

    #[test]
    fn forwarded_flag_must_match_the_subtree() {
        let codec = FrameCodec::new(1 << 20, 1 << 20);
        let mut frame = codec.encode_forward(&header(vec![])).unwrap();
        assert!(!FramePrefix::from(frame[0]).forwarded());
        frame[0] |= 0b1000_0000;
        assert!(matches!(codec.decode_forward(&frame), Err(Error::Decode(_))));
    }

    #[test]
    fn rejects_oversized_frames() {
        let codec = FrameCodec::new(16, 1 << 20);
        assert!(matches!(
            codec.encode_forward(&header(vec![])),
            Err(Error::FrameTooLarge(_))
        ));
    }

    #[test]
    fn rejects_other_versions() {
        let codec = FrameCodec::new(1 << 20, 1 << 20);
        let bundle = ReplyBundle {
            version: PROTOCOL_VERSION + 1,
            dispatch_id: 1,
            entries: vec![],
        };
        let frame = codec.encode_reply(&bundle).unwrap();
        assert!(matches!(
            codec.decode_reply(&frame),
            Err(Error::UnsupportedVersion(v)) if v == PROTOCOL_VERSION + 1
        ));
    }

    #[test]
    fn reply_frame_is_not_a_forward_frame() {
        let codec = FrameCodec::new(1 << 20, 1 << 20);
        let bundle = ReplyBundle {
            version: PROTOCOL_VERSION,
            dispatch_id: 1,
            entries: vec![],
        };
        let frame = codec.encode_reply(&bundle).unwrap();
        assert!(codec.decode_forward(&frame).is_err());
    }

    #[tokio::test]
    async fn frames_survive_a_stream() {
        let codec = FrameCodec::new(1 << 20, 1 << 20);
        let frame = codec.encode_forward(&header(vec![])).unwrap();
        let (mut client, mut server) = tokio::io::duplex(64);
        let written = frame.clone();
        let writer = tokio::spawn(async move { codec.write_frame(&mut client, &written).await });
        let read = codec.read_frame(&mut server).await.unwrap();
        writer.await.unwrap().unwrap();
        assert_eq!(read, frame);
    }
}
