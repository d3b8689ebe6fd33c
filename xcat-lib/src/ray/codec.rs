//! Packet encapsulation for the Ray wire format.
//!
//! A packet is laid out as:
//!
//! ```text
//! |  BLK #0  |  BLK #1  |   ...   |  BLK #N-1  |  SUM  |
//! | SZ |              CONTENT + padding        |       |
//!   2                    VAR                      32
//! ```
//!
//! `SZ` is the big-endian length of CONTENT, each BLK is one AES-256 block,
//! CONTENT is zero padded to the block boundary, and SUM is the SHA-512/256
//! checksum of the plaintext of blocks 0..N. Blocks are enciphered
//! independently with the sender's session key; the checksum trailer is sent
//! in the clear.
//!
//! Known weakness: this is not an AEAD. Independent ECB blocks leak equal
//! 16-byte plaintext blocks, and the checksum is not keyed. The format is
//! kept for wire compatibility with existing peers.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes256;
use sha2::{Digest, Sha512_256};

use super::handshake::SessionKeys;
use super::RayError;

pub const BLOCK_SIZE: usize = 16;
pub const CHECKSUM_SIZE: usize = 32;
pub const MAX_CONTENT_SIZE: usize = 0xFFFF;
/// Wire size of a packet carrying `MAX_CONTENT_SIZE` bytes.
pub const MAX_WIRE_SIZE: usize = 65584;
/// Wire size of the empty packet.
pub const MIN_WIRE_SIZE: usize = BLOCK_SIZE + CHECKSUM_SIZE;

/// Number of AES blocks needed for `SZ` plus `content_size` bytes of content.
pub(crate) fn block_count(content_size: usize) -> usize {
    (2 + content_size).div_ceil(BLOCK_SIZE)
}

pub(crate) fn checksum(plain: &[u8]) -> [u8; CHECKSUM_SIZE] {
    Sha512_256::digest(plain).into()
}

pub(crate) fn encrypt_blocks(cipher: &Aes256, data: &mut [u8]) {
    for block in data.chunks_exact_mut(BLOCK_SIZE) {
        cipher.encrypt_block(GenericArray::from_mut_slice(block));
    }
}

pub(crate) fn decrypt_blocks(cipher: &Aes256, data: &mut [u8]) {
    for block in data.chunks_exact_mut(BLOCK_SIZE) {
        cipher.decrypt_block(GenericArray::from_mut_slice(block));
    }
}

pub(crate) fn encap_with(cipher: &Aes256, content: &[u8]) -> Result<Vec<u8>, RayError> {
    let sz = content.len();
    if sz > MAX_CONTENT_SIZE {
        return Err(RayError::PacketTooLarge(sz));
    }

    let blocks = block_count(sz) * BLOCK_SIZE;
    let mut wire = vec![0u8; blocks + CHECKSUM_SIZE];
    wire[..2].copy_from_slice(&(sz as u16).to_be_bytes());
    wire[2..2 + sz].copy_from_slice(content);

    let sum = checksum(&wire[..blocks]);
    wire[blocks..].copy_from_slice(&sum);
    encrypt_blocks(cipher, &mut wire[..blocks]);
    Ok(wire)
}

pub(crate) fn decap_with(cipher: &Aes256, wire: &[u8]) -> Result<Vec<u8>, RayError> {
    let len = wire.len();
    if len > MAX_WIRE_SIZE {
        return Err(RayError::PacketTooLarge(len));
    }
    if len < MIN_WIRE_SIZE || (len - CHECKSUM_SIZE) % BLOCK_SIZE != 0 {
        return Err(RayError::IncorrectSize(len));
    }

    let mut buf = wire.to_vec();
    cipher.decrypt_block(GenericArray::from_mut_slice(&mut buf[..BLOCK_SIZE]));
    let sz = u16::from_be_bytes([buf[0], buf[1]]) as usize;

    let blocks = block_count(sz) * BLOCK_SIZE;
    if len != blocks + CHECKSUM_SIZE {
        return Err(RayError::IncorrectSize(len));
    }

    decrypt_blocks(cipher, &mut buf[BLOCK_SIZE..blocks]);
    if checksum(&buf[..blocks])[..] != buf[blocks..] {
        return Err(RayError::IntegrityCompromised);
    }

    buf.truncate(2 + sz);
    buf.drain(..2);
    Ok(buf)
}

/// Both directions of a negotiated session, for discrete-buffer use
/// (datagrams). Stream transports use [`super::RayStream`] instead.
pub struct Codec {
    wcipher: Aes256,
    rcipher: Aes256,
}

impl Codec {
    pub fn new(keys: &SessionKeys) -> Self {
        Self {
            wcipher: Aes256::new(&keys.write_key.into()),
            rcipher: Aes256::new(&keys.read_key.into()),
        }
    }

    /// Wrap one payload into its wire form, enciphered with the write key.
    pub fn encap(&self, content: &[u8]) -> Result<Vec<u8>, RayError> {
        encap_with(&self.wcipher, content)
    }

    /// Unwrap one wire packet, deciphering with the read key.
    pub fn decap(&self, wire: &[u8]) -> Result<Vec<u8>, RayError> {
        decap_with(&self.rcipher, wire)
    }
}
