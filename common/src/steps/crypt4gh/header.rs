use api::PipelineError;
use chacha20poly1305::aead::generic_array::GenericArray;
use chacha20poly1305::aead::Aead;
use chacha20poly1305::{ChaCha20Poly1305, KeyInit};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};

pub const MAGIC: &[u8; 8] = b"crypt4gh";
pub const VERSION: u32 = 1;
pub const NONCE_SIZE: usize = 12;
pub const TAG_SIZE: usize = 16;
pub const X25519_KEY_SIZE: usize = 32;
pub const DATA_KEY_SIZE: usize = 32;

const PACKET_TYPE_DATA_ENC: u32 = 0;
const DATA_ENC_METHOD_CHACHA20_POLY1305: u32 = 0;
const HEADER_ENCRYPTION_METHOD_X25519: u32 = 0;
const HKDF_INFO: &[u8] = b"crypt4gh-header-packet";

// one parsed header packet body, still sealed. `data` is
// encryption_method(4) || sender_pubkey(32) || nonce(12) || sealed(rest)
pub struct EncryptedPacket {
    pub data: Vec<u8>,
}

pub struct Header {
    pub packets: Vec<EncryptedPacket>,
}

fn derive_wrap_key(shared_secret: &x25519_dalek::SharedSecret) -> [u8; 32] {
    let hk = Hkdf::<Sha256>::new(None, shared_secret.as_bytes());
    let mut key = [0u8; 32];
    hk.expand(HKDF_INFO, &mut key)
        .expect("32 bytes is a valid HKDF-SHA256 output length");
    key
}

pub fn serialize_header(packets: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&VERSION.to_le_bytes());
    out.extend_from_slice(&(packets.len() as u32).to_le_bytes());
    for packet in packets {
        out.extend_from_slice(&((packet.len() + 4) as u32).to_le_bytes());
        out.extend_from_slice(packet);
    }
    out
}

// attempts to open one encrypted header packet with `recipient_sec`. returns
// the file's data key on success. a failure here is a normal outcome (the
// packet may be addressed to a different recipient), so the caller tries the
// next packet rather than treating it as fatal
pub fn try_open_packet(
    packet: &EncryptedPacket,
    recipient_sec: &StaticSecret,
) -> Option<[u8; DATA_KEY_SIZE]> {
    let d = &packet.data;
    if d.len() < 4 + X25519_KEY_SIZE + NONCE_SIZE + TAG_SIZE {
        return None;
    }
    let method = u32::from_le_bytes(d[0..4].try_into().ok()?);
    if method != HEADER_ENCRYPTION_METHOD_X25519 {
        return None;
    }

    let sender_pub_bytes: [u8; 32] = d[4..36].try_into().ok()?;
    let nonce_bytes = &d[36..36 + NONCE_SIZE];
    let sealed = &d[36 + NONCE_SIZE..];

    let sender_pub = PublicKey::from(sender_pub_bytes);
    let shared = recipient_sec.diffie_hellman(&sender_pub);
    let key = derive_wrap_key(&shared);

    let cipher = ChaCha20Poly1305::new(GenericArray::from_slice(&key));
    let nonce = GenericArray::from_slice(nonce_bytes);
    let plaintext = cipher.decrypt(nonce, sealed).ok()?;

    if plaintext.len() != 8 + DATA_KEY_SIZE {
        return None;
    }
    let packet_type = u32::from_le_bytes(plaintext[0..4].try_into().ok()?);
    let enc_method = u32::from_le_bytes(plaintext[4..8].try_into().ok()?);
    if packet_type != PACKET_TYPE_DATA_ENC || enc_method != DATA_ENC_METHOD_CHACHA20_POLY1305 {
        return None;
    }

    let mut data_key = [0u8; DATA_KEY_SIZE];
    data_key.copy_from_slice(&plaintext[8..]);
    Some(data_key)
}

// seals `data_key` to `recipient_pub` behind a fresh ephemeral keypair,
// returning a ready-to-append packet body (without the length prefix)
pub fn seal_packet(data_key: &[u8; DATA_KEY_SIZE], recipient_pub: &PublicKey) -> Vec<u8> {
    let mut rng = rand::rng();
    let mut sender_sec_bytes = [0u8; 32];
    rng.fill_bytes(&mut sender_sec_bytes);
    let sender_sec = StaticSecret::from(sender_sec_bytes);
    let sender_pub = PublicKey::from(&sender_sec);

    let shared = sender_sec.diffie_hellman(recipient_pub);
    let key = derive_wrap_key(&shared);

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rng.fill_bytes(&mut nonce_bytes);

    let mut plaintext = Vec::with_capacity(8 + DATA_KEY_SIZE);
    plaintext.extend_from_slice(&PACKET_TYPE_DATA_ENC.to_le_bytes());
    plaintext.extend_from_slice(&DATA_ENC_METHOD_CHACHA20_POLY1305.to_le_bytes());
    plaintext.extend_from_slice(data_key);

    let cipher = ChaCha20Poly1305::new(GenericArray::from_slice(&key));
    let nonce = GenericArray::from_slice(&nonce_bytes);
    let sealed = cipher
        .encrypt(nonce, plaintext.as_slice())
        .expect("chacha20poly1305 encryption over an in-memory buffer cannot fail");

    let mut out = Vec::with_capacity(4 + 32 + NONCE_SIZE + sealed.len());
    out.extend_from_slice(&HEADER_ENCRYPTION_METHOD_X25519.to_le_bytes());
    out.extend_from_slice(sender_pub.as_bytes());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&sealed);
    out
}
