use crate::shared::{ErrorType, ProtoError, ProtoResult};
use byteorder::{NativeEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

// Operation identifiers. The table is fixed and 1:1 with the request
// structures below; unknown identifiers terminate the connection.
pub const OP_NOP: u32 = 0;
pub const OP_INIT: u32 = 1;
pub const OP_CREATE_RESOURCE: u32 = 2;
pub const OP_IMPORT_RESOURCE: u32 = 3;
pub const OP_DESTROY_RESOURCE: u32 = 4;
pub const OP_SUBMIT_CMD: u32 = 5;
pub const OP_SUBMIT_FENCE: u32 = 6;

/// Every request starts with `{ op: u32 }`.
pub const HEADER_SIZE: usize = 4;

/// Command bytes carried inline in a SUBMIT_CMD body. Larger commands
/// continue out of band.
pub const CMD_INLINE_SIZE: usize = 256;

/// The only fence flag a guest may set.
pub const FENCE_MERGEABLE: u32 = 1 << 0;

/// Ceiling for a single request frame: header plus the largest body.
pub const MAX_REQUEST_SIZE: usize = HEADER_SIZE + SubmitCmdRequest::SIZE;

/// Exact body size and maximal descriptor count for an operation, or `None`
/// for an unknown op id.
#[inline]
pub fn op_limits(op: u32) -> Option<(usize, usize)> {
    match op {
        OP_NOP => Some((0, 0)),
        OP_INIT => Some((InitRequest::SIZE, 2)),
        OP_CREATE_RESOURCE => Some((CreateResourceRequest::SIZE, 0)),
        OP_IMPORT_RESOURCE => Some((ImportResourceRequest::SIZE, 1)),
        OP_DESTROY_RESOURCE => Some((DestroyResourceRequest::SIZE, 0)),
        OP_SUBMIT_CMD => Some((SubmitCmdRequest::SIZE, 0)),
        OP_SUBMIT_FENCE => Some((SubmitFenceRequest::SIZE, 0)),
        _ => None,
    }
}

/// Splits a raw frame into the op id and its body.
#[inline]
pub fn split_frame(frame: &[u8]) -> ProtoResult<(u32, &[u8])> {
    if frame.len() < HEADER_SIZE {
        return Err(ProtoError::Fatal(ErrorType::SizeMismatch));
    }

    let mut header = &frame[..HEADER_SIZE];
    let op = header.read_u32::<NativeEndian>()?;

    Ok((op, &frame[HEADER_SIZE..]))
}

/// Assembles a full request frame for the supplied op and body bytes.
#[inline]
pub fn encode_frame(op: u32, body: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER_SIZE + body.len());
    frame
        .write_u32::<NativeEndian>(op)
        .expect("Error writing frame header");
    frame.extend_from_slice(body);
    frame
}

#[inline]
fn check_body(body: &[u8], expected: usize) -> ProtoResult<()> {
    if body.len() != expected {
        return Err(ProtoError::Fatal(ErrorType::SizeMismatch));
    }
    Ok(())
}

/// INIT body: binds the shared-memory timeline (first descriptor) and an
/// optional wake eventfd (second descriptor) to the context.
#[derive(Debug, Eq, PartialEq)]
pub struct InitRequest {
    pub shmem_size: u32,
}

impl InitRequest {
    pub const SIZE: usize = 4;

    pub fn read(mut body: &[u8]) -> ProtoResult<InitRequest> {
        check_body(body, Self::SIZE)?;

        Ok(InitRequest {
            shmem_size: body.read_u32::<NativeEndian>()?,
        })
    }

    pub fn write<W: Write>(&self, stream: &mut W) -> io::Result<()> {
        stream.write_u32::<NativeEndian>(self.shmem_size)
    }
}

/// CREATE_RESOURCE body: allocates a blob in the renderer and exports it to
/// a descriptor returned in the reply.
#[derive(Debug, Eq, PartialEq)]
pub struct CreateResourceRequest {
    pub res_id: u32,
    pub blob_id: u64,
    pub blob_size: u64,
    pub blob_flags: u32,
}

impl CreateResourceRequest {
    pub const SIZE: usize = 24;

    pub fn read(mut body: &[u8]) -> ProtoResult<CreateResourceRequest> {
        check_body(body, Self::SIZE)?;

        Ok(CreateResourceRequest {
            res_id: body.read_u32::<NativeEndian>()?,
            blob_id: body.read_u64::<NativeEndian>()?,
            blob_size: body.read_u64::<NativeEndian>()?,
            blob_flags: body.read_u32::<NativeEndian>()?,
        })
    }

    pub fn write<W: Write>(&self, stream: &mut W) -> io::Result<()> {
        stream.write_u32::<NativeEndian>(self.res_id)?;
        stream.write_u64::<NativeEndian>(self.blob_id)?;
        stream.write_u64::<NativeEndian>(self.blob_size)?;
        stream.write_u32::<NativeEndian>(self.blob_flags)
    }
}

/// CREATE_RESOURCE reply. Sent unconditionally; a failed allocation reports
/// the invalid descriptor type and attaches no descriptor.
#[derive(Debug, Eq, PartialEq)]
pub struct CreateResourceReply {
    pub fd_type: u32,
    pub map_info: u32,
}

impl CreateResourceReply {
    pub const SIZE: usize = 8;

    pub fn read(mut body: &[u8]) -> ProtoResult<CreateResourceReply> {
        check_body(body, Self::SIZE)?;

        Ok(CreateResourceReply {
            fd_type: body.read_u32::<NativeEndian>()?,
            map_info: body.read_u32::<NativeEndian>()?,
        })
    }

    pub fn write<W: Write>(&self, stream: &mut W) -> io::Result<()> {
        stream.write_u32::<NativeEndian>(self.fd_type)?;
        stream.write_u32::<NativeEndian>(self.map_info)
    }
}

/// IMPORT_RESOURCE body: attaches the descriptor delivered with the frame to
/// the context under `res_id`.
#[derive(Debug, Eq, PartialEq)]
pub struct ImportResourceRequest {
    pub res_id: u32,
    pub fd_type: u32,
    pub size: u64,
}

impl ImportResourceRequest {
    pub const SIZE: usize = 16;

    pub fn read(mut body: &[u8]) -> ProtoResult<ImportResourceRequest> {
        check_body(body, Self::SIZE)?;

        Ok(ImportResourceRequest {
            res_id: body.read_u32::<NativeEndian>()?,
            fd_type: body.read_u32::<NativeEndian>()?,
            size: body.read_u64::<NativeEndian>()?,
        })
    }

    pub fn write<W: Write>(&self, stream: &mut W) -> io::Result<()> {
        stream.write_u32::<NativeEndian>(self.res_id)?;
        stream.write_u32::<NativeEndian>(self.fd_type)?;
        stream.write_u64::<NativeEndian>(self.size)
    }
}

/// DESTROY_RESOURCE body.
#[derive(Debug, Eq, PartialEq)]
pub struct DestroyResourceRequest {
    pub res_id: u32,
}

impl DestroyResourceRequest {
    pub const SIZE: usize = 4;

    pub fn read(mut body: &[u8]) -> ProtoResult<DestroyResourceRequest> {
        check_body(body, Self::SIZE)?;

        Ok(DestroyResourceRequest {
            res_id: body.read_u32::<NativeEndian>()?,
        })
    }

    pub fn write<W: Write>(&self, stream: &mut W) -> io::Result<()> {
        stream.write_u32::<NativeEndian>(self.res_id)
    }
}

/// SUBMIT_CMD body. `size` is the total command length; the first
/// `min(size, CMD_INLINE_SIZE)` bytes ride in `cmd` and the remainder is
/// read out of band from the same connection.
pub struct SubmitCmdRequest {
    pub size: u32,
    pub cmd: [u8; CMD_INLINE_SIZE],
}

impl SubmitCmdRequest {
    pub const SIZE: usize = 4 + CMD_INLINE_SIZE;

    pub fn read(mut body: &[u8]) -> ProtoResult<SubmitCmdRequest> {
        check_body(body, Self::SIZE)?;

        let size = body.read_u32::<NativeEndian>()?;
        let mut cmd = [0u8; CMD_INLINE_SIZE];
        body.read_exact(&mut cmd)?;

        Ok(SubmitCmdRequest { size, cmd })
    }

    pub fn write<W: Write>(&self, stream: &mut W) -> io::Result<()> {
        stream.write_u32::<NativeEndian>(self.size)?;
        stream.write_all(&self.cmd)
    }
}

/// SUBMIT_FENCE body: registers a fence on a ring slot.
#[derive(Debug, Eq, PartialEq)]
pub struct SubmitFenceRequest {
    pub flags: u32,
    pub ring_idx: u32,
    pub fence_id: u64,
}

impl SubmitFenceRequest {
    pub const SIZE: usize = 16;

    pub fn read(mut body: &[u8]) -> ProtoResult<SubmitFenceRequest> {
        check_body(body, Self::SIZE)?;

        Ok(SubmitFenceRequest {
            flags: body.read_u32::<NativeEndian>()?,
            ring_idx: body.read_u32::<NativeEndian>()?,
            fence_id: body.read_u64::<NativeEndian>()?,
        })
    }

    pub fn write<W: Write>(&self, stream: &mut W) -> io::Result<()> {
        stream.write_u32::<NativeEndian>(self.flags)?;
        stream.write_u32::<NativeEndian>(self.ring_idx)?;
        stream.write_u64::<NativeEndian>(self.fence_id)
    }
}

/// Handshake delivered by the proxy on the supervisor socket, one per
/// context, with the pre-connected context socket as its single descriptor.
#[derive(Debug)]
pub struct Handshake {
    pub ctx_id: u32,
    pub capset_id: u32,
    pub flags: u32,
    pub name_len: u32,
    pub name: [u8; Handshake::NAME_SIZE],
}

impl Handshake {
    pub const NAME_SIZE: usize = 64;
    pub const SIZE: usize = 16 + Self::NAME_SIZE;

    pub fn read(mut body: &[u8]) -> ProtoResult<Handshake> {
        if body.len() != Self::SIZE {
            return Err(ProtoError::Fatal(ErrorType::BadHandshake));
        }

        let ctx_id = body.read_u32::<NativeEndian>()?;
        let capset_id = body.read_u32::<NativeEndian>()?;
        let flags = body.read_u32::<NativeEndian>()?;
        let name_len = body.read_u32::<NativeEndian>()?;
        let mut name = [0u8; Self::NAME_SIZE];
        body.read_exact(&mut name)?;

        if ctx_id == 0 || name_len as usize > Self::NAME_SIZE {
            return Err(ProtoError::Fatal(ErrorType::BadHandshake));
        }

        Ok(Handshake {
            ctx_id,
            capset_id,
            flags,
            name_len,
            name,
        })
    }

    pub fn write<W: Write>(&self, stream: &mut W) -> io::Result<()> {
        stream.write_u32::<NativeEndian>(self.ctx_id)?;
        stream.write_u32::<NativeEndian>(self.capset_id)?;
        stream.write_u32::<NativeEndian>(self.flags)?;
        stream.write_u32::<NativeEndian>(self.name_len)?;
        stream.write_all(&self.name)
    }

    /// The guest application name carried in the handshake.
    pub fn name(&self) -> ProtoResult<&str> {
        std::str::from_utf8(&self.name[..self.name_len as usize])
            .map_err(|_| ProtoError::Fatal(ErrorType::BadHandshake))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_limits_table() {
        assert_eq!(op_limits(OP_NOP), Some((0, 0)));
        assert_eq!(op_limits(OP_INIT), Some((4, 2)));
        assert_eq!(op_limits(OP_CREATE_RESOURCE), Some((24, 0)));
        assert_eq!(op_limits(OP_IMPORT_RESOURCE), Some((16, 1)));
        assert_eq!(op_limits(OP_DESTROY_RESOURCE), Some((4, 0)));
        assert_eq!(op_limits(OP_SUBMIT_CMD), Some((260, 0)));
        assert_eq!(op_limits(OP_SUBMIT_FENCE), Some((16, 0)));
        assert_eq!(op_limits(0xdead_beef), None);
    }

    #[test]
    fn test_split_frame() {
        let frame = encode_frame(OP_DESTROY_RESOURCE, &[1, 0, 0, 0]);

        let (op, body) = split_frame(&frame).unwrap();

        assert_eq!(op, OP_DESTROY_RESOURCE);
        assert_eq!(body, &[1, 0, 0, 0]);
    }

    #[test]
    fn test_split_frame_err_runt() {
        let result = split_frame(&[0, 0]);

        assert_eq!(result.unwrap_err(), ProtoError::Fatal(ErrorType::SizeMismatch));
    }

    #[test]
    fn test_submit_fence_roundtrip() {
        let request = SubmitFenceRequest {
            flags: FENCE_MERGEABLE,
            ring_idx: 3,
            fence_id: 0x1_0000_0007,
        };

        let mut body = Vec::new();
        request.write(&mut body).unwrap();

        assert_eq!(body.len(), SubmitFenceRequest::SIZE);
        assert_eq!(SubmitFenceRequest::read(&body).unwrap(), request);
    }

    #[test]
    fn test_create_resource_roundtrip() {
        let request = CreateResourceRequest {
            res_id: 77,
            blob_id: 0x1122_3344_5566_7788,
            blob_size: 4096,
            blob_flags: 3,
        };

        let mut body = Vec::new();
        request.write(&mut body).unwrap();

        assert_eq!(body.len(), CreateResourceRequest::SIZE);
        assert_eq!(CreateResourceRequest::read(&body).unwrap(), request);
    }

    #[test]
    fn test_body_size_must_match_exactly() {
        let result = InitRequest::read(&[0u8; InitRequest::SIZE + 1]);

        assert_eq!(result.unwrap_err(), ProtoError::Fatal(ErrorType::SizeMismatch));
    }

    #[test]
    fn test_submit_cmd_layout() {
        let mut cmd = [0u8; CMD_INLINE_SIZE];
        cmd[0] = 0xaa;
        cmd[CMD_INLINE_SIZE - 1] = 0xbb;

        let request = SubmitCmdRequest { size: 1024, cmd };

        let mut body = Vec::new();
        request.write(&mut body).unwrap();

        let parsed = SubmitCmdRequest::read(&body).unwrap();

        assert_eq!(parsed.size, 1024);
        assert_eq!(parsed.cmd[0], 0xaa);
        assert_eq!(parsed.cmd[CMD_INLINE_SIZE - 1], 0xbb);
    }

    #[test]
    fn test_handshake_name() {
        let mut name = [0u8; Handshake::NAME_SIZE];
        name[..9].copy_from_slice(b"quake3e.x");

        let handshake = Handshake {
            ctx_id: 4,
            capset_id: 1,
            flags: 0,
            name_len: 9,
            name,
        };

        let mut body = Vec::new();
        handshake.write(&mut body).unwrap();

        let parsed = Handshake::read(&body).unwrap();

        assert_eq!(parsed.ctx_id, 4);
        assert_eq!(parsed.name().unwrap(), "quake3e.x");
    }

    #[test]
    fn test_handshake_rejects_zero_ctx_id() {
        let handshake = Handshake {
            ctx_id: 0,
            capset_id: 0,
            flags: 0,
            name_len: 0,
            name: [0u8; Handshake::NAME_SIZE],
        };

        let mut body = Vec::new();
        handshake.write(&mut body).unwrap();

        let result = Handshake::read(&body);

        assert_eq!(result.unwrap_err(), ProtoError::Fatal(ErrorType::BadHandshake));
    }

    #[test]
    fn test_handshake_rejects_oversized_name_len() {
        let handshake = Handshake {
            ctx_id: 1,
            capset_id: 0,
            flags: 0,
            name_len: Handshake::NAME_SIZE as u32 + 1,
            name: [0u8; Handshake::NAME_SIZE],
        };

        let mut body = Vec::new();
        handshake.write(&mut body).unwrap();

        let result = Handshake::read(&body);

        assert_eq!(result.unwrap_err(), ProtoError::Fatal(ErrorType::BadHandshake));
    }
}
