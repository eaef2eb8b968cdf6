use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use sha2::{Digest, Sha256};

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

pub fn verify_sha256(bytes: &[u8], expected_hex: &str) -> Result<bool> {
    let expected = normalized_digest(expected_hex)?;
    Ok(sha256_hex(bytes) == expected)
}

pub fn verify_sha256_reader(reader: &mut impl Read, expected_hex: &str) -> Result<bool> {
    let expected = normalized_digest(expected_hex)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0_u8; 64 * 1024];
    loop {
        let read = reader
            .read(&mut buffer)
            .context("failed reading data for sha256 verification")?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()) == expected)
}

pub fn verify_sha256_file(path: &Path, expected_hex: &str) -> Result<bool> {
    let file =
        File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut reader = BufReader::new(file);
    verify_sha256_reader(&mut reader, expected_hex)
        .with_context(|| format!("failed to verify sha256 of {}", path.display()))
}

fn normalized_digest(expected_hex: &str) -> Result<String> {
    let expected = expected_hex.trim().to_ascii_lowercase();
    if expected.len() != 64 || hex::decode(&expected).is_err() {
        return Err(anyhow!("invalid sha256 digest: '{expected_hex}'"));
    }
    Ok(expected)
}
