//! Shared-secret authentication for both transports.
//!
//! The secret is 32 random bytes, hex-encoded, generated on first boot
//! and persisted next to the database with owner-only permissions.

use rand::RngCore;
use std::io;
use std::path::Path;
use tonic::metadata::MetadataMap;
use tonic::Status;

/// Length of the raw secret in bytes (64 hex characters on disk).
pub const TOKEN_BYTES: usize = 32;

/// Load the token from `path`, generating and persisting a fresh one if
/// the file is absent.
pub fn load_or_generate_token<P: AsRef<Path>>(path: P) -> io::Result<String> {
    let p = path.as_ref();
    if p.exists() {
        let raw = std::fs::read_to_string(p)?;
        let token = raw.trim().to_string();
        if token.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "empty token file"));
        }
        return Ok(token);
    }
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    let token = hex::encode(bytes);
    std::fs::write(p, &token)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(p, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(token)
}

/// gRPC-side check: the `authorization` metadata entry must equal the
/// boot token.
pub fn check_grpc_auth(md: &MetadataMap, token: &str) -> Result<(), Status> {
    match md.get("authorization").and_then(|v| v.to_str().ok()) {
        Some(got) if got == token => Ok(()),
        _ => Err(Status::unauthenticated("invalid authorization")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_persists_across_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kernel.token");
        let first = load_or_generate_token(&path).unwrap();
        assert_eq!(first.len(), TOKEN_BYTES * 2);
        let second = load_or_generate_token(&path).unwrap();
        assert_eq!(first, second);
    }

    #[cfg(unix)]
    #[test]
    fn token_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kernel.token");
        load_or_generate_token(&path).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn grpc_check_requires_exact_match() {
        let mut md = MetadataMap::new();
        assert!(check_grpc_auth(&md, "tok").is_err());
        md.insert("authorization", "wrong".parse().unwrap());
        assert!(check_grpc_auth(&md, "tok").is_err());
        md.insert("authorization", "tok".parse().unwrap());
        assert!(check_grpc_auth(&md, "tok").is_ok());
    }
}
