//! Big-endian binary codec shared by the request and response formats.
use bytes::Buf;
use bytes::BufMut;
use thiserror::Error;

#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum CodecError {
    #[error("unexpected end of input while reading {0}")]
    UnexpectedEof(&'static str),

    #[error("unsupported version: {0}")]
    UnsupportedVersion(u8),

    #[error("unsupported query type: {0}")]
    UnsupportedQueryType(u8),

    #[error("{remaining} trailing bytes after {what}")]
    TrailingBytes {
        what: &'static str,
        remaining: usize,
    },

    #[error("{field} is too long: {len}")]
    TooLong { field: &'static str, len: usize },

    #[error("invalid boolean value {0:#04x}")]
    InvalidBool(u8),

    #[error("{0} is not valid utf-8")]
    InvalidUtf8(&'static str),

    #[error("invalid signature length: {0}")]
    InvalidSignatureLength(usize),
}

pub(crate) struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn ensure(
        &self,
        len: usize,
        field: &'static str,
    ) -> Result<(), CodecError> {
        if self.buf.remaining() < len {
            return Err(CodecError::UnexpectedEof(field));
        }
        Ok(())
    }

    pub(crate) fn u8(
        &mut self,
        field: &'static str,
    ) -> Result<u8, CodecError> {
        self.ensure(1, field)?;
        Ok(self.buf.get_u8())
    }

    pub(crate) fn u16(
        &mut self,
        field: &'static str,
    ) -> Result<u16, CodecError> {
        self.ensure(2, field)?;
        Ok(self.buf.get_u16())
    }

    pub(crate) fn u32(
        &mut self,
        field: &'static str,
    ) -> Result<u32, CodecError> {
        self.ensure(4, field)?;
        Ok(self.buf.get_u32())
    }

    pub(crate) fn u64(
        &mut self,
        field: &'static str,
    ) -> Result<u64, CodecError> {
        self.ensure(8, field)?;
        Ok(self.buf.get_u64())
    }

    pub(crate) fn bool(
        &mut self,
        field: &'static str,
    ) -> Result<bool, CodecError> {
        match self.u8(field)? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(CodecError::InvalidBool(other)),
        }
    }

    pub(crate) fn array<const N: usize>(
        &mut self,
        field: &'static str,
    ) -> Result<[u8; N], CodecError> {
        self.ensure(N, field)?;
        let mut out = [0u8; N];
        self.buf.copy_to_slice(&mut out);
        Ok(out)
    }

    pub(crate) fn fixed(
        &mut self,
        len: usize,
        field: &'static str,
    ) -> Result<Vec<u8>, CodecError> {
        self.ensure(len, field)?;
        let mut out = vec![0u8; len];
        self.buf.copy_to_slice(&mut out);
        Ok(out)
    }

    /// Reads a `u32` length prefixed byte string.
    pub(crate) fn bytes(
        &mut self,
        field: &'static str,
    ) -> Result<Vec<u8>, CodecError> {
        let len = self.u32(field)? as usize;
        self.fixed(len, field)
    }

    pub(crate) fn string(
        &mut self,
        field: &'static str,
    ) -> Result<String, CodecError> {
        String::from_utf8(self.bytes(field)?).map_err(|_| CodecError::InvalidUtf8(field))
    }

    /// Fails if any input is left unconsumed.
    pub(crate) fn finish(
        self,
        what: &'static str,
    ) -> Result<(), CodecError> {
        match self.buf.remaining() {
            0 => Ok(()),
            remaining => Err(CodecError::TrailingBytes { what, remaining }),
        }
    }
}

pub(crate) fn put_bytes(
    out: &mut Vec<u8>,
    field: &'static str,
    data: &[u8],
) -> Result<(), CodecError> {
    let len = u32::try_from(data.len()).map_err(|_| {
        CodecError::TooLong {
            field,
            len: data.len(),
        }
    })?;
    out.put_u32(len);
    out.put_slice(data);
    Ok(())
}

pub(crate) fn put_count(
    out: &mut Vec<u8>,
    field: &'static str,
    count: usize,
) -> Result<(), CodecError> {
    let count = u8::try_from(count).map_err(|_| CodecError::TooLong { field, len: count })?;
    out.put_u8(count);
    Ok(())
}
