use api::PipelineError;
use chacha20poly1305::aead::generic_array::GenericArray;
use chacha20poly1305::aead::Aead;
use chacha20poly1305::{ChaCha20Poly1305, KeyInit};
use rand::RngCore;

use super::header::{DATA_KEY_SIZE, NONCE_SIZE, TAG_SIZE};

pub const SEGMENT_PLAINTEXT_SIZE: usize = 64 * 1024;

// wire size of one fully-encrypted segment holding exactly
// `SEGMENT_PLAINTEXT_SIZE` of plaintext
pub const MAX_SEGMENT_WIRE_SIZE: usize = NONCE_SIZE + SEGMENT_PLAINTEXT_SIZE + TAG_SIZE;

// encrypts one plaintext segment (at most `SEGMENT_PLAINTEXT_SIZE` bytes)
// under the file's data key, returning `nonce(12) || ciphertext || tag(16)`
pub fn seal_segment(data_key: &[u8; DATA_KEY_SIZE], plaintext: &[u8]) -> Vec<u8> {
    let cipher = ChaCha20Poly1305::new(GenericArray::from_slice(data_key));
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::rng().fill_bytes(&mut nonce_bytes);
    let nonce = GenericArray::from_slice(&nonce_bytes);

    let sealed = cipher
        .encrypt(nonce, plaintext)
        .expect("chacha20poly1305 encryption over an in-memory buffer cannot fail");

    let mut out = Vec::with_capacity(NONCE_SIZE + sealed.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&sealed);
    out
}

// opens one wire segment (`nonce || ciphertext || tag`), returning the
// plaintext. an authentication failure here always means the payload has
// been tampered with or the wrong key was used -- never silently skipped
pub fn open_segment(data_key: &[u8; DATA_KEY_SIZE], wire: &[u8]) -> Result<Vec<u8>, PipelineError> {
    if wire.len() < NONCE_SIZE + TAG_SIZE {
        return Err(PipelineError::FormatError(
            "truncated crypt4gh data segment".into(),
        ));
    }
    let (nonce_bytes, ciphertext) = wire.split_at(NONCE_SIZE);
    let cipher = ChaCha20Poly1305::new(GenericArray::from_slice(data_key));
    let nonce = GenericArray::from_slice(nonce_bytes);

    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| PipelineError::CryptoAuthError("data segment failed authentication".into()))
}
