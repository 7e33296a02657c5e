//! JWT generation pipeline: fill the on-disk cache with signed tokens, then
//! stream them to workers. Signing dominates CPU for large runs, so batches
//! are fanned out across all cores and checkpointed to disk as each signer
//! finishes, letting an interrupted generation resume where it left off.

pub(crate) mod cache;
pub mod signer;

use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};
use uuid::Uuid;

use crate::error::{Error, Result};
use cache::JwtCache;
use signer::{Claims, JwtSigner};

const BATCH_SIZE: u64 = 1_000_000;
const STREAM_CAPACITY: usize = 1_000_000;
const PRIME_DELAY: Duration = Duration::from_secs(1);

/// Everything that shapes a token; also the identity of the cache file.
#[derive(Debug, Clone, Default)]
pub struct JwtConfig {
    pub key_path: PathBuf,
    pub kid: String,
    pub sub: String,
    pub iss: String,
    pub aud: String,
    pub custom_claims: String,
}

pub struct JwtGenerator {
    config: JwtConfig,
    signer: Arc<JwtSigner>,
    key_blob: Vec<u8>,
    custom: Claims,
}

impl JwtGenerator {
    pub fn new(config: JwtConfig) -> Result<Self> {
        let key_blob = std::fs::read(&config.key_path)?;
        let signer = Arc::new(JwtSigner::new(&key_blob, &config.kid)?);
        let custom = if config.custom_claims.is_empty() {
            Claims::new()
        } else {
            match serde_json::from_str::<Value>(&config.custom_claims) {
                Ok(Value::Object(map)) => map,
                _ => {
                    return Err(Error::Config(
                        "jwt-claims must be a json object".to_string(),
                    ))
                }
            }
        };
        Ok(JwtGenerator {
            config,
            signer,
            key_blob,
            custom,
        })
    }

    /// Cache filename derived from everything that shapes a token. CR/LF are
    /// stripped from the key bytes so the identity is stable across
    /// platforms.
    pub fn cache_file(&self, dir: &Path) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(self.config.aud.as_bytes());
        hasher.update(self.config.iss.as_bytes());
        hasher.update(self.config.sub.as_bytes());
        hasher.update(self.config.custom_claims.as_bytes());
        let normalized: Vec<u8> = self
            .key_blob
            .iter()
            .copied()
            .filter(|b| *b != b'\r' && *b != b'\n')
            .collect();
        hasher.update(&normalized);
        hasher.update(self.config.kid.as_bytes());
        dir.join(format!(
            "gopayloader-jwtstore-{:x}.txt",
            hasher.finalize()
        ))
    }

    /// Bring the cache up to `required` tokens. A corrupt cache file is
    /// deleted and rebuilt once; a second failure is terminal.
    pub async fn generate(
        &self,
        required: u64,
        dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let path = self.cache_file(dir);
        let cache = match JwtCache::open(&path) {
            Ok(cache) => cache,
            Err(Error::CorruptCache(msg)) => {
                error!("jwt cache corrupt, deleting and recreating; {}", msg);
                std::fs::remove_file(&path)?;
                JwtCache::open(&path)?
            }
            Err(e) => return Err(e),
        };

        if cache.count() >= required {
            debug!("no jwts to generate, enough in cache");
            return Ok(());
        }

        let signer = self.signer.clone();
        let base = self.base_claims();
        let cancel = cancel.clone();
        tokio::task::spawn_blocking(move || batch_generate(cache, required, &signer, &base, &cancel))
            .await
            .map_err(|e| Error::Config(format!("jwt generation task died; {}", e)))?
    }

    /// Stream `count` tokens out of the cache.
    pub async fn jwts(
        &self,
        count: u64,
        dir: &Path,
    ) -> Result<(async_channel::Receiver<String>, async_channel::Receiver<Error>)> {
        let cache = JwtCache::open(&self.cache_file(dir))?;
        cache.read(count).await
    }

    fn base_claims(&self) -> Claims {
        let mut claims = self.custom.clone();
        if !self.config.aud.is_empty() {
            claims.insert("aud".to_string(), Value::String(self.config.aud.clone()));
        }
        if !self.config.sub.is_empty() {
            claims.insert("sub".to_string(), Value::String(self.config.sub.clone()));
        }
        if !self.config.iss.is_empty() {
            claims.insert("iss".to_string(), Value::String(self.config.iss.clone()));
        }
        let exp = chrono::Utc::now() + chrono::Duration::days(365);
        claims.insert("exp".to_string(), Value::from(exp.timestamp()));
        claims
    }
}

/// Fill the cache batch by batch. Every core signs its share of a batch and
/// the coordinator appends each share as it lands, so progress survives
/// cancellation and crashes.
fn batch_generate(
    mut cache: JwtCache,
    required: u64,
    signer: &JwtSigner,
    base: &Claims,
    cancel: &CancellationToken,
) -> Result<()> {
    loop {
        let existing = cache.count();
        if existing >= required {
            return Ok(());
        }
        let batch = (required - existing).min(BATCH_SIZE);
        let workers = num_cpus::get() as u64;
        let per = batch / workers;
        let extra = batch % workers;
        debug!(batch, workers, "generating jwt batch");

        let (tx, rx) = std::sync::mpsc::channel::<Result<Vec<String>>>();
        std::thread::scope(|scope| -> Result<()> {
            for i in 0..workers {
                let quota = if i == 0 { per + extra } else { per };
                if quota == 0 {
                    continue;
                }
                let tx = tx.clone();
                scope.spawn(move || {
                    let _ = tx.send(sign_batch(signer, base, quota));
                });
            }
            drop(tx);

            for outcome in rx {
                if cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                let tokens = outcome?;
                if tokens.is_empty() {
                    continue;
                }
                debug!(count = tokens.len(), "jwt share signed, saving to cache");
                cache.append(&tokens)?;
            }
            Ok(())
        })?;
    }
}

fn sign_batch(signer: &JwtSigner, base: &Claims, quota: u64) -> Result<Vec<String>> {
    let mut tokens = Vec::with_capacity(quota as usize);
    for _ in 0..quota {
        let mut claims = base.clone();
        claims.insert(
            "jti".to_string(),
            Value::String(Uuid::new_v4().to_string()),
        );
        tokens.push(signer.sign(&claims)?);
    }
    Ok(tokens)
}

/// Stream tokens from a user-supplied file (one per line, no header),
/// cycling from the top when it holds fewer than `count`.
pub async fn stream_jwt_file(
    path: &Path,
    count: u64,
) -> Result<(async_channel::Receiver<String>, async_channel::Receiver<Error>)> {
    let meta = std::fs::metadata(path)?;
    if meta.len() == 0 {
        return Err(Error::Config(format!(
            "jwt file {} is empty",
            path.display()
        )));
    }

    let (tx, rx) = async_channel::bounded(STREAM_CAPACITY);
    let (err_tx, err_rx) = async_channel::bounded(1);
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || cycle_file(path, count, tx, err_tx));
    tokio::time::sleep(PRIME_DELAY).await;
    Ok((rx, err_rx))
}

fn cycle_file(
    path: PathBuf,
    count: u64,
    tx: async_channel::Sender<String>,
    err_tx: async_channel::Sender<Error>,
) {
    let file = match File::open(&path) {
        Ok(f) => f,
        Err(e) => {
            let _ = err_tx.send_blocking(e.into());
            return;
        }
    };
    let mut reader = BufReader::new(file);
    let mut sent = 0u64;
    let mut line = String::new();
    while sent < count {
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) => {
                if sent == 0 {
                    let _ = err_tx.send_blocking(Error::Config(format!(
                        "jwt file {} holds no tokens",
                        path.display()
                    )));
                    return;
                }
                if reader.seek(SeekFrom::Start(0)).is_err() {
                    return;
                }
            }
            Ok(_) => {
                let token = line.trim_end();
                if token.is_empty() {
                    continue;
                }
                if tx.send_blocking(token.to_string()).is_err() {
                    return;
                }
                sent += 1;
            }
            Err(e) => {
                let _ = err_tx.send_blocking(e.into());
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn generator(dir: &Path, secret: &[u8]) -> JwtGenerator {
        let key_path = dir.join("key.secret");
        std::fs::write(&key_path, secret).unwrap();
        JwtGenerator::new(JwtConfig {
            key_path,
            kid: "kid-1".to_string(),
            sub: "my-sub".to_string(),
            iss: "my-iss".to_string(),
            aud: "my-aud".to_string(),
            custom_claims: String::new(),
        })
        .unwrap()
    }

    #[test]
    fn cache_filename_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let a = generator(dir.path(), b"secret-a");
        let b = generator(dir.path(), b"secret-a");
        assert_eq!(a.cache_file(dir.path()), b.cache_file(dir.path()));

        let name = a
            .cache_file(dir.path())
            .file_name()
            .unwrap()
            .to_string_lossy()
            .into_owned();
        assert!(name.starts_with("gopayloader-jwtstore-"));
        assert!(name.ends_with(".txt"));
        // 64 hex chars between prefix and extension
        let hash = &name["gopayloader-jwtstore-".len()..name.len() - 4];
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn cache_filename_keyed_on_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let a = generator(dir.path(), b"secret-a");
        let b = generator(dir.path(), b"secret-b");
        assert_ne!(a.cache_file(dir.path()), b.cache_file(dir.path()));
    }

    #[test]
    fn key_newlines_do_not_change_identity() {
        let dir = tempfile::tempdir().unwrap();
        let a = generator(dir.path(), b"secret-material");
        let b = generator(dir.path(), b"secret-\nmaterial\r\n");
        assert_eq!(
            a.cache_file(dir.path()).file_name(),
            b.cache_file(dir.path()).file_name()
        );
    }

    #[tokio::test]
    async fn generate_fills_and_reuses_cache() {
        let dir = tempfile::tempdir().unwrap();
        let generator = generator(dir.path(), b"secret");
        let cancel = CancellationToken::new();

        generator.generate(10, dir.path(), &cancel).await.unwrap();
        let path = generator.cache_file(dir.path());
        let after_first = std::fs::read(&path).unwrap();
        assert_eq!(&after_first[..2], b"10");

        // second run only appends the shortfall
        generator.generate(20, dir.path(), &cancel).await.unwrap();
        let after_second = std::fs::read(&path).unwrap();
        assert_eq!(&after_second[..2], b"20");
        // previously stored tokens are untouched
        assert_eq!(
            &after_second[cache::HEADER_LEN + 1..after_first.len()],
            &after_first[cache::HEADER_LEN + 1..]
        );

        let (rx, _errs) = generator.jwts(20, dir.path()).await.unwrap();
        let mut n = 0;
        while let Ok(token) = rx.recv().await {
            assert_eq!(token.split('.').count(), 3);
            n += 1;
        }
        assert_eq!(n, 20);
    }

    #[tokio::test]
    async fn corrupt_cache_is_rebuilt_once() {
        let dir = tempfile::tempdir().unwrap();
        let generator = generator(dir.path(), b"secret");
        let path = generator.cache_file(dir.path());
        std::fs::write(&path, b"not a valid header at all\n").unwrap();

        let cancel = CancellationToken::new();
        generator.generate(5, dir.path(), &cancel).await.unwrap();
        let raw = std::fs::read(&path).unwrap();
        assert_eq!(&raw[..1], b"5");
    }

    #[tokio::test]
    async fn file_stream_cycles_short_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.txt");
        std::fs::write(&path, "tok.a.1\ntok.b.2\n").unwrap();

        let (rx, _errs) = stream_jwt_file(&path, 5).await.unwrap();
        let mut got = Vec::new();
        while let Ok(token) = rx.recv().await {
            got.push(token);
        }
        assert_eq!(got, vec!["tok.a.1", "tok.b.2", "tok.a.1", "tok.b.2", "tok.a.1"]);
    }
}
