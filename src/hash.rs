//! File hashing, used to tell whether a post is already on disk.

use std::cmp::min;
use std::io::ErrorKind;
use std::path::Path;

use digest::Digest;
use tokio::io::AsyncReadExt;

const DEFAULT_BUF_SIZE: usize = 2 * 1024 * 1024; // 2MB

/// Hash the file at `filepath` with `D`, and return the lowercase hex digest.
///
/// The file is read in chunks of at most 2MB, and the hashing runs on the rayon pool,
/// so that the async runtime is not blocked by large files.
pub async fn hash_file<D: Digest + Send + 'static>(
    filepath: impl AsRef<Path>,
) -> std::io::Result<String> {
    let mut file = tokio::fs::File::open(filepath).await?;
    let file_size = file.metadata().await?.len();
    let buf_size =
        usize::try_from(file_size).map_or(DEFAULT_BUF_SIZE, |size| min(DEFAULT_BUF_SIZE, size));

    let mut hasher = Box::new(D::new());
    let mut buf = vec![u8::default(); buf_size].into_boxed_slice();
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        (hasher, buf) = tokio_rayon::spawn(move || {
            hasher.update(&buf[..n]);
            (hasher, buf)
        })
        .await;
    }

    Ok(base16ct::lower::encode_string(&hasher.finalize()))
}

/// Check if the file at `filepath` has the MD5 hash `md5` (lowercase hex).
///
/// A missing file does not match.
pub async fn md5_matches(
    filepath: impl AsRef<Path>,
    md5: impl AsRef<str>,
) -> std::io::Result<bool> {
    type Hasher = md5::Md5;

    match hash_file::<Hasher>(filepath).await {
        Ok(file_md5) => Ok(file_md5.eq_ignore_ascii_case(md5.as_ref())),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}
