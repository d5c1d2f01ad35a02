//! Shared message-framing/sending logic.
//!
//! Node-to-node traffic carries an out-of-band control word ahead of every
//! frame: `flag:u8 [len:u32 word:u32] frame`. Traffic to attached client
//! endpoints is sent as bare frames - clients never route, so they never see
//! control words.

use bytes::Bytes;

use channel::{Channel, ChannelError, Result};
use wire::Message;

/// Byte size of a serialized control word.
const CONTROL_WORD_LEN: u32 = 4;

/// Send the control field (present or absent) ahead of a frame.
pub async fn send_control(chan: &mut dyn Channel, control: Option<u32>) -> Result<()> {
    match control {
        Some(word) => {
            let mut buf = [0u8; 9];
            buf[0] = 1;
            buf[1..5].copy_from_slice(&CONTROL_WORD_LEN.to_le_bytes());
            buf[5..9].copy_from_slice(&word.to_le_bytes());
            chan.send_bytes(&buf).await
        }
        None => chan.send_bytes(&[0u8]).await,
    }
}

/// Send a message behind its control field.
pub async fn send_with_control(
    chan: &mut dyn Channel,
    control: Option<u32>,
    msg: &Message,
) -> Result<()> {
    send_control(chan, control).await?;
    chan.send_message(msg).await
}

/// Send an already-packed message behind its control field.
pub async fn send_packed_with_control(
    chan: &mut dyn Channel,
    control: Option<u32>,
    packed: &[u8],
) -> Result<()> {
    send_control(chan, control).await?;
    chan.send_frame(packed).await
}

/// Receive the control field preceding a frame.
pub async fn recv_control(chan: &mut dyn Channel) -> Result<Option<u32>> {
    let mut flag = [0u8; 1];
    chan.recv_exact(&mut flag).await?;
    if flag[0] == 0 {
        return Ok(None);
    }
    let mut len = [0u8; 4];
    chan.recv_exact(&mut len).await?;
    let len = u32::from_le_bytes(len);
    if len != CONTROL_WORD_LEN {
        return Err(ChannelError::Protocol(format!(
            "control field length {len} (expected {CONTROL_WORD_LEN})"
        )));
    }
    let mut word = [0u8; 4];
    chan.recv_exact(&mut word).await?;
    Ok(Some(u32::from_le_bytes(word)))
}

/// Receive one routed unit: control field plus packed frame.
pub async fn recv_routed(chan: &mut dyn Channel) -> Result<(Option<u32>, Bytes)> {
    let control = recv_control(chan).await?;
    let frame = chan.recv_frame().await?;
    Ok((control, frame))
}
