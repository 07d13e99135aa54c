mod header;
mod segment;

use std::sync::Arc;

use api::{Metadata, PipelineError};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use serde_json::json;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use self::header::{serialize_header, try_open_packet, Header, EncryptedPacket, DATA_KEY_SIZE};
use self::segment::{open_segment, MAX_SEGMENT_WIRE_SIZE};
use crate::carrier::{Carrier, CarrierIo, QueueCarrier};
use crate::config::PipelineConfig;
use crate::step::{CarrierStream, PipelineStep, StepArgs};
use crate::steps::support::single_input;

fn internal(err: impl std::fmt::Display) -> PipelineError {
    PipelineError::Internal(anyhow::anyhow!(err.to_string()))
}

// strips PEM armor and base64-decodes the body, taking the last 32 bytes of
// the decoded blob as the raw key. crypt4gh's reference implementation wraps
// keys in an optional passphrase-encrypted container; this server only ever
// accepts unwrapped keys, so a plain 32-byte encoding is sufficient here.
// the intermediate decoded buffer is zeroized on drop -- key material
// handed in through a request is request-scoped
fn parse_crypt4gh_pem(pem: &str) -> Result<Zeroizing<[u8; 32]>, PipelineError> {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;

    let body: String = pem
        .lines()
        .filter(|line| !line.starts_with("-----"))
        .collect();

    let decoded = Zeroizing::new(
        STANDARD
            .decode(body.trim())
            .map_err(|e| PipelineError::FormatError(format!("malformed crypt4gh key PEM: {e}")))?,
    );

    if decoded.len() < 32 {
        return Err(PipelineError::FormatError(
            "crypt4gh key PEM decodes to fewer than 32 bytes".into(),
        ));
    }

    let mut key = Zeroizing::new([0u8; 32]);
    key.copy_from_slice(&decoded[decoded.len() - 32..]);
    Ok(key)
}

fn parse_secret_key(pem: &str) -> Result<StaticSecret, PipelineError> {
    Ok(StaticSecret::from(*parse_crypt4gh_pem(pem)?))
}

fn parse_public_key(pem: &str) -> Result<PublicKey, PipelineError> {
    Ok(PublicKey::from(*parse_crypt4gh_pem(pem)?))
}

async fn read_exact(carrier: &mut Carrier, n: usize) -> Result<Bytes, PipelineError> {
    let mut buf = BytesMut::with_capacity(n);
    while buf.len() < n {
        let chunk = carrier.read((n - buf.len()) as i64).await?;
        if chunk.is_empty() {
            return Err(PipelineError::FormatError(
                "truncated crypt4gh stream".into(),
            ));
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf.freeze())
}

// reads up to `max` bytes, stopping early at a clean end of stream. used for
// data segments, where the final segment is legitimately shorter than the
// rest
async fn read_up_to(carrier: &mut Carrier, max: usize) -> Result<Bytes, PipelineError> {
    let mut buf = BytesMut::with_capacity(max);
    while buf.len() < max {
        let chunk = carrier.read((max - buf.len()) as i64).await?;
        if chunk.is_empty() {
            break;
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf.freeze())
}

async fn read_header(carrier: &mut Carrier) -> Result<Header, PipelineError> {
    let prelude = read_exact(carrier, 16).await?;
    if &prelude[0..8] != header::MAGIC {
        return Err(PipelineError::FormatError(
            "not a crypt4gh stream: bad magic".into(),
        ));
    }
    let version = u32::from_le_bytes(prelude[8..12].try_into().unwrap());
    if version != header::VERSION {
        return Err(PipelineError::FormatError(format!(
            "unsupported crypt4gh version {version}"
        )));
    }
    let packet_count = u32::from_le_bytes(prelude[12..16].try_into().unwrap()) as usize;

    let mut packets = Vec::with_capacity(packet_count);
    for _ in 0..packet_count {
        let len_bytes = read_exact(carrier, 4).await?;
        let packet_len = u32::from_le_bytes(len_bytes[..].try_into().unwrap()) as usize;
        if packet_len < 4 {
            return Err(PipelineError::FormatError(
                "crypt4gh packet length shorter than its own length field".into(),
            ));
        }
        let data = read_exact(carrier, packet_len - 4).await?;
        packets.push(EncryptedPacket {
            data: data.to_vec(),
        });
    }

    Ok(Header { packets })
}

fn open_data_key(
    header: &Header,
    recipient_sec: &StaticSecret,
) -> Result<[u8; DATA_KEY_SIZE], PipelineError> {
    header
        .packets
        .iter()
        .find_map(|p| try_open_packet(p, recipient_sec))
        .ok_or_else(|| {
            PipelineError::CryptoAuthError(
                "no header packet could be opened with the supplied key".into(),
            )
        })
}

// opens the header and decrypts the data segments, streaming plaintext out
// through a Queue carrier
pub struct DecryptCrypt4gh {
    config: Arc<PipelineConfig>,
}

impl DecryptCrypt4gh {
    pub fn new(config: Arc<PipelineConfig>) -> Self {
        DecryptCrypt4gh { config }
    }
}

#[async_trait]
impl PipelineStep for DecryptCrypt4gh {
    async fn process(
        &self,
        inputs: Option<CarrierStream>,
        args: StepArgs,
    ) -> Result<CarrierStream, PipelineError> {
        let recipient_sec = parse_secret_key(&args.require_str("recipient_sec")?)?;
        let mut carrier = single_input(inputs, &args, &self.config).await?;

        let metadata = Metadata::default().with_media_type("application/octet-stream");
        let (producer, out_carrier) = QueueCarrier::new(self.config.queue_capacity, metadata);

        let task = tokio::spawn(async move {
            let result = async {
                let header = read_header(&mut carrier).await?;
                let data_key = open_data_key(&header, &recipient_sec)?;
                loop {
                    let wire = read_up_to(&mut carrier, MAX_SEGMENT_WIRE_SIZE).await?;
                    if wire.is_empty() {
                        break;
                    }
                    let plaintext = open_segment(&data_key, &wire)?;
                    producer.push(Bytes::from(plaintext)).await?;
                }
                Ok::<(), PipelineError>(())
            }
            .await;

            match result {
                Ok(()) => producer.finish().await,
                Err(e) => producer.fail(&e).await,
            }
        });

        let out_carrier = out_carrier.with_producer_handle(task.abort_handle());
        Ok(Box::pin(futures::stream::once(async {
            Ok(Carrier::Queue(out_carrier))
        })))
    }
}

// opens the header with `recipient_sec`, wraps the recovered data key for
// `recipient_pub` and re-emits the stream with the new packet appended. the
// payload is copied through untouched -- this step never decrypts data
// segments
pub struct AddRecipientCrypt4gh {
    config: Arc<PipelineConfig>,
}

impl AddRecipientCrypt4gh {
    pub fn new(config: Arc<PipelineConfig>) -> Self {
        AddRecipientCrypt4gh { config }
    }
}

#[async_trait]
impl PipelineStep for AddRecipientCrypt4gh {
    async fn process(
        &self,
        inputs: Option<CarrierStream>,
        args: StepArgs,
    ) -> Result<CarrierStream, PipelineError> {
        let recipient_sec = parse_secret_key(&args.require_str("recipient_sec")?)?;
        let new_recipient_pub = parse_public_key(&args.require_str("recipient_pub")?)?;
        let mut carrier = single_input(inputs, &args, &self.config).await?;
        let chunk_size = self.config.chunk_size;

        let metadata = carrier.metadata().clone();
        let (producer, out_carrier) = QueueCarrier::new(self.config.queue_capacity, metadata);

        let task = tokio::spawn(async move {
            let result = async {
                let header = read_header(&mut carrier).await?;
                let data_key = open_data_key(&header, &recipient_sec)?;

                let mut raw_packets: Vec<Vec<u8>> =
                    header.packets.into_iter().map(|p| p.data).collect();
                raw_packets.push(header::seal_packet(&data_key, &new_recipient_pub));
                producer
                    .push(Bytes::from(serialize_header(&raw_packets)))
                    .await?;

                loop {
                    let chunk = carrier.read(chunk_size as i64).await?;
                    if chunk.is_empty() {
                        break;
                    }
                    producer.push(chunk).await?;
                }
                Ok::<(), PipelineError>(())
            }
            .await;

            match result {
                Ok(()) => producer.finish().await,
                Err(e) => producer.fail(&e).await,
            }
        });

        let out_carrier = out_carrier.with_producer_handle(task.abort_handle());
        Ok(Box::pin(futures::stream::once(async {
            Ok(Carrier::Queue(out_carrier))
        })))
    }
}

// walks a whole crypt4gh stream -- header and every data segment -- without
// emitting plaintext, reporting `{"valid": true}` or `{"valid": false,
// "error": "..."}` instead of propagating a format or crypto error upward
pub struct ValidateCrypt4gh {
    config: Arc<PipelineConfig>,
}

impl ValidateCrypt4gh {
    pub fn new(config: Arc<PipelineConfig>) -> Self {
        ValidateCrypt4gh { config }
    }
}

#[async_trait]
impl PipelineStep for ValidateCrypt4gh {
    async fn process(
        &self,
        inputs: Option<CarrierStream>,
        args: StepArgs,
    ) -> Result<CarrierStream, PipelineError> {
        let recipient_sec = parse_secret_key(&args.require_str("recipient_sec")?)?;
        let mut carrier = single_input(inputs, &args, &self.config).await?;

        let outcome: Result<(), PipelineError> = async {
            let header = read_header(&mut carrier).await?;
            let data_key = open_data_key(&header, &recipient_sec)?;
            loop {
                let wire = read_up_to(&mut carrier, MAX_SEGMENT_WIRE_SIZE).await?;
                if wire.is_empty() {
                    break;
                }
                open_segment(&data_key, &wire)?;
            }
            Ok(())
        }
        .await;

        let body = match outcome {
            Ok(()) => json!({ "valid": true, "error": null }),
            Err(e) if e.is_validation_failure() => json!({ "valid": false, "error": e.to_string() }),
            Err(e) => return Err(e),
        };

        let metadata = Metadata::default().with_media_type("application/json");
        let out = Carrier::bytes(Bytes::from(serde_json::to_vec(&body).map_err(internal)?), metadata);
        Ok(Box::pin(futures::stream::once(async { Ok(out) })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn config() -> Arc<PipelineConfig> {
        Arc::new(PipelineConfig::default())
    }

    fn pem_of(key_bytes: [u8; 32]) -> String {
        use base64::engine::general_purpose::STANDARD;
        use base64::Engine;
        format!(
            "-----BEGIN CRYPT4GH PRIVATE KEY-----\n{}\n-----END CRYPT4GH PRIVATE KEY-----\n",
            STANDARD.encode(key_bytes)
        )
    }

    fn build_fixture(recipient_pub: &PublicKey, plaintext: &[u8]) -> Vec<u8> {
        let data_key = [9u8; header::DATA_KEY_SIZE];
        let packet = header::seal_packet(&data_key, recipient_pub);
        let mut out = serialize_header(&[packet]);
        for chunk in plaintext.chunks(segment::SEGMENT_PLAINTEXT_SIZE) {
            out.extend_from_slice(&segment::seal_segment(&data_key, chunk));
        }
        out
    }

    fn input_stream(data: Vec<u8>) -> CarrierStream {
        let carrier = Carrier::bytes(data, api::Metadata::default());
        Box::pin(futures::stream::once(async move { Ok(carrier) }))
    }

    #[tokio::test]
    async fn decrypt_recovers_original_plaintext() {
        let recipient_sec = StaticSecret::from([1u8; 32]);
        let recipient_pub = PublicKey::from(&recipient_sec);
        let plaintext = b"a secret message carried through the pipeline";
        let fixture = build_fixture(&recipient_pub, plaintext);

        let step = DecryptCrypt4gh::new(config());
        let args = StepArgs {
            arguments: serde_json::json!({ "recipient_sec": pem_of(recipient_sec.to_bytes()) }),
            source_url: None,
        };
        let mut output = step
            .process(Some(input_stream(fixture)), args)
            .await
            .unwrap();
        let mut carrier = output.next().await.unwrap().unwrap();
        let body = carrier.read_to_end().await.unwrap();
        assert_eq!(&body[..], &plaintext[..]);
    }

    #[tokio::test]
    async fn decrypt_with_wrong_key_fails_crypto_auth() {
        let recipient_sec = StaticSecret::from([2u8; 32]);
        let recipient_pub = PublicKey::from(&recipient_sec);
        let fixture = build_fixture(&recipient_pub, b"payload");

        let wrong_sec = StaticSecret::from([3u8; 32]);
        let step = DecryptCrypt4gh::new(config());
        let args = StepArgs {
            arguments: serde_json::json!({ "recipient_sec": pem_of(wrong_sec.to_bytes()) }),
            source_url: None,
        };
        let mut output = step
            .process(Some(input_stream(fixture)), args)
            .await
            .unwrap();
        let mut carrier = output.next().await.unwrap().unwrap();
        let err = carrier.read_to_end().await.unwrap_err();
        // the Queue carrier's channel discipline carries the original error
        // variant across the producer/consumer boundary, not just its text
        assert!(matches!(err, PipelineError::CryptoAuthError(_)));
        assert!(err.to_string().contains("no header packet could be opened"));
    }

    #[tokio::test]
    async fn add_recipient_then_decrypt_with_new_key_matches_original() {
        let sec_a = StaticSecret::from([4u8; 32]);
        let pub_a = PublicKey::from(&sec_a);
        let sec_b = StaticSecret::from([5u8; 32]);
        let pub_b = PublicKey::from(&sec_b);
        let plaintext = b"file originally encrypted only to recipient A";
        let fixture = build_fixture(&pub_a, plaintext);

        let add_recipient = AddRecipientCrypt4gh::new(config());
        let args = StepArgs {
            arguments: serde_json::json!({
                "recipient_sec": pem_of(sec_a.to_bytes()),
                "recipient_pub": pem_of(pub_b.to_bytes()),
            }),
            source_url: None,
        };
        let mut rewrapped_stream = add_recipient
            .process(Some(input_stream(fixture)), args)
            .await
            .unwrap();
        let mut rewrapped_carrier = rewrapped_stream.next().await.unwrap().unwrap();
        let rewrapped_bytes = rewrapped_carrier.read_to_end().await.unwrap();

        let decrypt = DecryptCrypt4gh::new(config());
        let args = StepArgs {
            arguments: serde_json::json!({ "recipient_sec": pem_of(sec_b.to_bytes()) }),
            source_url: None,
        };
        let mut output = decrypt
            .process(Some(input_stream(rewrapped_bytes.to_vec())), args)
            .await
            .unwrap();
        let mut carrier = output.next().await.unwrap().unwrap();
        let body = carrier.read_to_end().await.unwrap();
        assert_eq!(&body[..], &plaintext[..]);
    }

    #[tokio::test]
    async fn validate_reports_true_on_a_sound_stream() {
        let recipient_sec = StaticSecret::from([6u8; 32]);
        let recipient_pub = PublicKey::from(&recipient_sec);
        let fixture = build_fixture(&recipient_pub, b"validated payload");

        let step = ValidateCrypt4gh::new(config());
        let args = StepArgs {
            arguments: serde_json::json!({ "recipient_sec": pem_of(recipient_sec.to_bytes()) }),
            source_url: None,
        };
        let mut output = step
            .process(Some(input_stream(fixture)), args)
            .await
            .unwrap();
        let mut carrier = output.next().await.unwrap().unwrap();
        let body = carrier.read_to_end().await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["valid"], true);
        assert_eq!(parsed["error"], serde_json::Value::Null);
    }

    #[tokio::test]
    async fn validate_reports_false_on_a_tampered_segment() {
        let recipient_sec = StaticSecret::from([8u8; 32]);
        let recipient_pub = PublicKey::from(&recipient_sec);
        let mut fixture = build_fixture(&recipient_pub, b"will be corrupted");
        let last = fixture.len() - 1;
        fixture[last] ^= 0xff;

        let step = ValidateCrypt4gh::new(config());
        let args = StepArgs {
            arguments: serde_json::json!({ "recipient_sec": pem_of(recipient_sec.to_bytes()) }),
            source_url: None,
        };
        let mut output = step
            .process(Some(input_stream(fixture)), args)
            .await
            .unwrap();
        let mut carrier = output.next().await.unwrap().unwrap();
        let body = carrier.read_to_end().await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["valid"], false);
        assert!(parsed["error"].as_str().is_some_and(|s| !s.is_empty()));
    }
}
