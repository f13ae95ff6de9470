use sha2::{Digest, Sha256};

/// Достаёт DTLS fingerprint (`a=fingerprint:...`) из SDP
pub fn dtls_fingerprint(sdp: &str) -> Option<String> {
    sdp.lines()
        .map(str::trim)
        .find_map(|line| line.strip_prefix("a=fingerprint:"))
        .map(|fp| fp.trim().to_ascii_uppercase())
}

/// Код проверки звонка: одинаков у обеих сторон, не зависит от того,
/// кто offer, а кто answer. 48 бит (12 hex символов).
pub fn verification_code(local_sdp: &str, remote_sdp: &str) -> Option<String> {
    let local = dtls_fingerprint(local_sdp)?;
    let remote = dtls_fingerprint(remote_sdp)?;

    let (first, second) = if local <= remote {
        (local, remote)
    } else {
        (remote, local)
    };

    let mut hasher = Sha256::new();
    hasher.update(first.as_bytes());
    hasher.update(b"|");
    hasher.update(second.as_bytes());
    let digest = hasher.finalize();
    Some(hex::encode(&digest[..6]))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SDP_A: &str = "v=0\r\no=- 1 2 IN IP4 127.0.0.1\r\na=fingerprint:sha-256 AB:CD:EF\r\n";
    const SDP_B: &str = "v=0\r\na=fingerprint:sha-256 12:34:56\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n";

    #[test]
    fn extracts_fingerprint() {
        assert_eq!(dtls_fingerprint(SDP_A).as_deref(), Some("SHA-256 AB:CD:EF"));
        assert_eq!(dtls_fingerprint("v=0\r\n"), None);
    }

    #[test]
    fn code_is_symmetric() {
        let a = verification_code(SDP_A, SDP_B).unwrap();
        let b = verification_code(SDP_B, SDP_A).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 12);
    }

    #[test]
    fn missing_fingerprint_yields_none() {
        assert_eq!(verification_code(SDP_A, "v=0\r\n"), None);
    }
}
