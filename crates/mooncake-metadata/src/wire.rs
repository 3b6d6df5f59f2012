//! Length-prefixed JSON framing shared by the handshake client and
//! listener (§6 "Handshake wire format").

use std::io::{self, Read, Write};

use mooncake_common::{MooncakeError, MooncakeResult};
use serde::{de::DeserializeOwned, Serialize};

const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

pub(crate) fn write_message<T: Serialize>(stream: &mut impl Write, value: &T) -> MooncakeResult<()> {
    let payload = serde_json::to_vec(value)?;
    let len = u32::try_from(payload.len())
        .map_err(|_| MooncakeError::invalid_argument("handshake payload too large"))?;
    stream.write_all(&len.to_be_bytes())?;
    stream.write_all(&payload)?;
    stream.flush()?;
    Ok(())
}

pub(crate) fn read_message<T: DeserializeOwned>(stream: &mut impl Read) -> MooncakeResult<T> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(MooncakeError::SocketFail(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("handshake frame of {len} bytes exceeds the {MAX_FRAME_LEN} byte limit"),
        )));
    }
    let mut payload = vec![0u8; len as usize];
    stream.read_exact(&mut payload)?;
    let value = serde_json::from_slice(&payload)?;
    Ok(value)
}
