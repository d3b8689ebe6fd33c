//! Session key negotiation.
//!
//! Both peers derive the same 32-byte mask from the shared credentials, then
//! exchange masked random keys and prove knowledge of the mask under the
//! fresh keys. The exchange is symmetric: either side may initiate, and both
//! ends of a connection run it concurrently.

use aes::cipher::KeyInit;
use aes::Aes256;
use rand::RngCore;
use sha2::{Digest, Sha512_256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::codec::{decrypt_blocks, encrypt_blocks};
use super::RayError;

pub const KEY_SIZE: usize = 32;

/// The two independent session keys of one negotiated transport. `write_key`
/// enciphers what this side sends; `read_key` deciphers what it receives.
#[derive(Clone, Debug)]
pub struct SessionKeys {
    pub write_key: [u8; KEY_SIZE],
    pub read_key: [u8; KEY_SIZE],
}

/// Derive the credential mask: the first halves of the SHA-512/256 digests
/// of username and password, concatenated.
pub(crate) fn credential_mask(user: &[u8], password: &[u8]) -> [u8; KEY_SIZE] {
    let usum = Sha512_256::digest(user);
    let psum = Sha512_256::digest(password);
    let mut mask = [0u8; KEY_SIZE];
    mask[..16].copy_from_slice(&usum[..16]);
    mask[16..].copy_from_slice(&psum[..16]);
    mask
}

/// Run the negotiation over `io`. On success both sides hold keys such that
/// each side's `write_key` is the peer's `read_key`.
///
/// Round one sends our fresh write key XOR-ed with the mask and unmasks the
/// peer's. Round two sends the mask enciphered under our write key; the
/// peer's copy, deciphered under the read key, must match ours or the
/// credentials differ.
pub async fn handshake<T>(io: &mut T, user: &[u8], password: &[u8]) -> Result<SessionKeys, RayError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let mask = credential_mask(user, password);

    let mut write_key = [0u8; KEY_SIZE];
    rand::rng().fill_bytes(&mut write_key);

    let mut msg = [0u8; KEY_SIZE];
    for i in 0..KEY_SIZE {
        msg[i] = write_key[i] ^ mask[i];
    }
    io.write_all(&msg).await?;
    io.read_exact(&mut msg).await?;

    let mut read_key = [0u8; KEY_SIZE];
    for i in 0..KEY_SIZE {
        read_key[i] = msg[i] ^ mask[i];
    }

    let wcipher = Aes256::new(&write_key.into());
    let rcipher = Aes256::new(&read_key.into());

    msg = mask;
    encrypt_blocks(&wcipher, &mut msg);
    io.write_all(&msg).await?;
    io.read_exact(&mut msg).await?;
    decrypt_blocks(&rcipher, &mut msg);

    if msg != mask {
        return Err(RayError::AuthenticationFailed);
    }

    Ok(SessionKeys { write_key, read_key })
}
