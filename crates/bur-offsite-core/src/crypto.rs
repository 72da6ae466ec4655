//! CryptoCodec: compress+encrypt / decrypt+decompress a single file, with parallel fan-out
//! over a directory (spec §4.1).
//!
//! Heavy lifting happens in external processes (`gzip`, `gpg`); the "thread pool" described
//! by the spec is realised as a bounded set of concurrent tokio tasks gated by a semaphore.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;

use crate::error::{CryptoError, CryptoResult};
use crate::process;

const GPG_CIPHER_ALGO: &str = "AES256";
const GPG_COMPRESS_ALGO: &str = "none";
const GPG_KEY_TYPE: &str = "RSA";
const GPG_KEY_LENGTH: &str = "1024";

/// Compresses and encrypts files by shelling out to `gzip` and `gpg`.
#[derive(Debug, Clone)]
pub struct CryptoCodec {
    gpg_home: PathBuf,
    gpg_user_name: String,
    gpg_user_email: String,
    process_timeout: Duration,
}

impl CryptoCodec {
    pub fn new(
        gpg_home: PathBuf,
        gpg_user_name: impl Into<String>,
        gpg_user_email: impl Into<String>,
        process_timeout: Duration,
    ) -> Self {
        Self {
            gpg_home,
            gpg_user_name: gpg_user_name.into(),
            gpg_user_email: gpg_user_email.into(),
            process_timeout,
        }
    }

    /// Ensure a usable GPG key exists for `gpg_user_email`, creating one if absent.
    ///
    /// "Permission denied" while reading the keyring is fatal and reports the current OS
    /// user for diagnosis, matching the source's `validate_encryption_key`.
    pub async fn ensure_key(&self) -> CryptoResult<()> {
        let out = process::run(
            "gpg",
            &[
                "--homedir",
                self.gpg_home_str(),
                "--list-keys",
                &self.gpg_user_email,
            ],
            self.process_timeout,
        )
        .await
        .map_err(|e| CryptoError::EncryptFailed {
            path: self.gpg_user_email.clone(),
            detail: e.to_string(),
        })?;

        let stderr_lower = out.stderr.to_lowercase();

        if stderr_lower.contains("permission denied") {
            return Err(CryptoError::GpgPermissionDenied {
                path: self.gpg_home_str().to_string(),
                user: current_user(),
            });
        }

        if stderr_lower.contains("error reading key") || !out.status_success {
            return self.create_key().await;
        }

        Ok(())
    }

    async fn create_key(&self) -> CryptoResult<()> {
        let batch = format!(
            "Key-Type: {GPG_KEY_TYPE}\nKey-Length: {GPG_KEY_LENGTH}\nName-Real: {}\nName-Email: {}\n%commit\n",
            self.gpg_user_name, self.gpg_user_email
        );
        let batch_path = self.gpg_home.join(".bur-offsite-gen-key.batch");
        tokio::fs::write(&batch_path, batch)
            .await
            .map_err(CryptoError::Io)?;

        let out = process::run(
            "gpg",
            &[
                "--homedir",
                self.gpg_home_str(),
                "--batch",
                "--gen-key",
                batch_path.to_str().unwrap_or_default(),
            ],
            self.process_timeout,
        )
        .await
        .map_err(|e| CryptoError::GpgKeyCreationFailed(e.to_string()))?;

        let _ = tokio::fs::remove_file(&batch_path).await;

        if !out.status_success {
            return Err(CryptoError::GpgKeyCreationFailed(out.stderr));
        }
        Ok(())
    }

    fn gpg_home_str(&self) -> &str {
        self.gpg_home.to_str().unwrap_or_default()
    }

    /// Compress `src_path` (gzip) then encrypt with GPG, writing `dst_dir/<base>.gz.gpg`.
    ///
    /// The intermediate `.gz` is removed on success; it survives a failed encrypt step so a
    /// retry can resume from it.
    pub async fn encrypt_one(&self, src_path: &Path, dst_dir: &Path) -> CryptoResult<PathBuf> {
        let gz_path = self.gzip_one(src_path, dst_dir).await?;

        match self.gpg_encrypt_one(&gz_path, dst_dir).await {
            Ok(gpg_path) => {
                tokio::fs::remove_file(&gz_path).await.map_err(CryptoError::Io)?;
                Ok(gpg_path)
            }
            Err(e) => Err(e),
        }
    }

    async fn gzip_one(&self, src_path: &Path, dst_dir: &Path) -> CryptoResult<PathBuf> {
        let base = src_path
            .file_name()
            .ok_or_else(|| CryptoError::CompressFailed {
                path: src_path.display().to_string(),
                detail: "path has no file name".into(),
            })?;
        let gz_path = dst_dir.join(format!("{}.gz", base.to_string_lossy()));

        let out = process::run(
            "sh",
            &[
                "-c",
                &format!(
                    "gzip -c {} > {}",
                    shell_quote(&src_path.display().to_string()),
                    shell_quote(&gz_path.display().to_string())
                ),
            ],
            self.process_timeout,
        )
        .await
        .map_err(|e| CryptoError::CompressFailed {
            path: src_path.display().to_string(),
            detail: e.to_string(),
        })?;

        if !out.status_success {
            return Err(CryptoError::CompressFailed {
                path: src_path.display().to_string(),
                detail: out.stderr,
            });
        }
        Ok(gz_path)
    }

    async fn gpg_encrypt_one(&self, gz_path: &Path, dst_dir: &Path) -> CryptoResult<PathBuf> {
        let out_name = format!(
            "{}.gpg",
            gz_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        );
        let out_path = dst_dir.join(out_name);

        let out = process::run(
            "gpg",
            &[
                "--homedir",
                self.gpg_home_str(),
                "--output",
                out_path.to_str().unwrap_or_default(),
                "-r",
                &self.gpg_user_email,
                "--cipher-algo",
                GPG_CIPHER_ALGO,
                "--compress-algo",
                GPG_COMPRESS_ALGO,
                "--encrypt",
                gz_path.to_str().unwrap_or_default(),
            ],
            self.process_timeout,
        )
        .await
        .map_err(|e| CryptoError::EncryptFailed {
            path: gz_path.display().to_string(),
            detail: e.to_string(),
        })?;

        if !out.status_success {
            return Err(CryptoError::EncryptFailed {
                path: gz_path.display().to_string(),
                detail: out.stderr,
            });
        }
        Ok(out_path)
    }

    /// Symmetric inverse of [`Self::encrypt_one`]: `<x>.gz.gpg` -> `<x>.gz` -> `<x>`.
    pub async fn decrypt_one(&self, enc_path: &Path) -> CryptoResult<PathBuf> {
        let gz_path = self.gpg_decrypt_one(enc_path).await?;
        let dec_path = self.gunzip_one(&gz_path).await?;
        tokio::fs::remove_file(&gz_path).await.map_err(CryptoError::Io)?;
        Ok(dec_path)
    }

    async fn gpg_decrypt_one(&self, enc_path: &Path) -> CryptoResult<PathBuf> {
        let stem = enc_path
            .to_str()
            .and_then(|s| s.strip_suffix(".gpg"))
            .ok_or_else(|| CryptoError::DecryptFailed {
                path: enc_path.display().to_string(),
                detail: "expected a '.gpg' suffix".into(),
            })?;
        let gz_path = PathBuf::from(stem);

        let out = process::run(
            "gpg",
            &[
                "--homedir",
                self.gpg_home_str(),
                "--output",
                gz_path.to_str().unwrap_or_default(),
                "--decrypt",
                enc_path.to_str().unwrap_or_default(),
            ],
            self.process_timeout,
        )
        .await
        .map_err(|e| CryptoError::DecryptFailed {
            path: enc_path.display().to_string(),
            detail: e.to_string(),
        })?;

        if !out.status_success {
            return Err(CryptoError::DecryptFailed {
                path: enc_path.display().to_string(),
                detail: out.stderr,
            });
        }
        Ok(gz_path)
    }

    async fn gunzip_one(&self, gz_path: &Path) -> CryptoResult<PathBuf> {
        let dest_name = gz_path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_suffix(".gz"))
            .ok_or_else(|| CryptoError::DecompressFailed {
                path: gz_path.display().to_string(),
                detail: "expected a '.gz' suffix".into(),
            })?
            .to_owned();
        let dest_path = gz_path.with_file_name(dest_name);

        let out = process::run(
            "sh",
            &[
                "-c",
                &format!(
                    "gunzip -c {} > {}",
                    shell_quote(&gz_path.display().to_string()),
                    shell_quote(&dest_path.display().to_string())
                ),
            ],
            self.process_timeout,
        )
        .await
        .map_err(|e| CryptoError::DecompressFailed {
            path: gz_path.display().to_string(),
            detail: e.to_string(),
        })?;

        if !out.status_success {
            return Err(CryptoError::DecompressFailed {
                path: gz_path.display().to_string(),
                detail: out.stderr,
            });
        }
        Ok(dest_path)
    }

    /// Encrypt every non-directory entry of `src_dir` into `dst_dir`, up to `parallelism`
    /// concurrent workers. Fails iff at least one file failed; aggregates all error messages.
    pub async fn encrypt_many(
        &self,
        src_dir: &Path,
        dst_dir: &Path,
        parallelism: usize,
    ) -> CryptoResult<()> {
        if !src_dir.is_dir() {
            return Err(CryptoError::NotADirectory(src_dir.display().to_string()));
        }

        let mut entries = tokio::fs::read_dir(src_dir).await.map_err(CryptoError::Io)?;
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(CryptoError::Io)? {
            if entry.file_type().await.map_err(CryptoError::Io)?.is_file() {
                files.push(entry.path());
            }
        }

        let semaphore = Arc::new(Semaphore::new(parallelism.max(1)));
        let mut set = tokio::task::JoinSet::new();

        for file in files {
            let codec = self.clone();
            let dst_dir = dst_dir.to_owned();
            let permit = semaphore.clone();
            set.spawn(async move {
                let _permit = permit.acquire_owned().await.expect("semaphore not closed");
                codec.encrypt_one(&file, &dst_dir).await.map_err(|e| (file, e))
            });
        }

        collect_join_errors(set).await
    }

    /// Decrypt every `*.gz.gpg` entry of `dir`, up to `parallelism` concurrent workers.
    pub async fn decrypt_many(&self, dir: &Path, parallelism: usize) -> CryptoResult<()> {
        if !dir.is_dir() {
            return Err(CryptoError::NotADirectory(dir.display().to_string()));
        }

        let mut entries = tokio::fs::read_dir(dir).await.map_err(CryptoError::Io)?;
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(CryptoError::Io)? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("gpg") {
                files.push(path);
            }
        }

        let semaphore = Arc::new(Semaphore::new(parallelism.max(1)));
        let mut set = tokio::task::JoinSet::new();

        for file in files {
            let codec = self.clone();
            let permit = semaphore.clone();
            set.spawn(async move {
                let _permit = permit.acquire_owned().await.expect("semaphore not closed");
                codec.decrypt_one(&file).await.map(|_| ()).map_err(|e| (file, e))
            });
        }

        collect_join_errors(set).await
    }
}

async fn collect_join_errors(
    mut set: tokio::task::JoinSet<Result<(), (PathBuf, CryptoError)>>,
) -> CryptoResult<()> {
    let mut failures = Vec::new();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err((path, err))) => failures.push(format!("{}: {err}", path.display())),
            Err(join_err) => failures.push(join_err.to_string()),
        }
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(CryptoError::EncryptFailed {
            path: "multiple files".into(),
            detail: failures.join("; "),
        })
    }
}

fn current_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn gzip_then_gunzip_roundtrips_a_file() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("payload.txt");
        tokio::fs::write(&src, b"hello offsite").await.unwrap();

        let codec = CryptoCodec::new(tmp.path().to_owned(), "n", "e@example.com", Duration::from_secs(10));
        let gz = codec.gzip_one(&src, tmp.path()).await.unwrap();
        assert!(gz.ends_with("payload.txt.gz"));

        let dec = codec.gunzip_one(&gz).await.unwrap();
        let content = tokio::fs::read(&dec).await.unwrap();
        assert_eq!(content, b"hello offsite");
    }

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("a'b"), "'a'\\''b'");
    }
}
