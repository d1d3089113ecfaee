//! JKS encoding and the matching reader used to verify generated stores.

use crate::{password_bytes, sha1, PkiError, Result};

const MAGIC: u32 = 0xFEED_FEED;
const VERSION: u32 = 2;
const TAG_PRIVATE_KEY: u32 = 1;
const CERT_TYPE: &str = "X.509";
/// Keyed into the trailing integrity digest by every JKS implementation.
const WHITENER: &[u8] = b"Mighty Aphrodite";
/// 1.3.6.1.4.1.42.2.17.1.1, the proprietary JKS key protection algorithm.
const KEY_PROTECTOR_OID: [u8; 12] = [0x06, 0x0A, 0x2B, 0x06, 0x01, 0x04, 0x01, 0x2A, 0x02, 0x11, 0x01, 0x01];
const DIGEST_LEN: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeystoreEntry {
    pub alias: String,
    pub created_ms: u64,
    /// Unprotected PKCS#8 private key.
    pub key_pkcs8: Vec<u8>,
    /// Certificates, leaf first, DER encoded.
    pub chain: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeystoreSummary {
    pub version: u32,
    pub entries: Vec<KeystoreEntry>,
}

pub(crate) fn encode(entries: &[KeystoreEntry], password: &str, salt: &[u8; DIGEST_LEN]) -> Result<Vec<u8>> {
    let pw = password_bytes(password);
    let mut out = Vec::new();
    out.extend(MAGIC.to_be_bytes());
    out.extend(VERSION.to_be_bytes());
    out.extend((entries.len() as u32).to_be_bytes());
    for e in entries {
        out.extend(TAG_PRIVATE_KEY.to_be_bytes());
        write_utf(&mut out, &e.alias, "alias")?;
        out.extend(e.created_ms.to_be_bytes());
        let protected = encrypted_private_key_info(&protect(&e.key_pkcs8, &pw, salt));
        write_bytes(&mut out, &protected, "protected key")?;
        out.extend((e.chain.len() as u32).to_be_bytes());
        for cert in &e.chain {
            write_utf(&mut out, CERT_TYPE, "certificate type")?;
            write_bytes(&mut out, cert, "certificate")?;
        }
    }
    let digest = sha1(&[pw.as_slice(), WHITENER, out.as_slice()]);
    out.extend(digest);
    Ok(out)
}

/// Parse a keystore, verify its integrity digest and recover every key.
pub fn inspect(bytes: &[u8], password: &str) -> Result<KeystoreSummary> {
    let pw = password_bytes(password);
    if bytes.len() < 12 + DIGEST_LEN {
        return Err(PkiError::Malformed("truncated header".into()));
    }
    let (body, digest) = bytes.split_at(bytes.len() - DIGEST_LEN);
    if sha1(&[pw.as_slice(), WHITENER, body]) != digest {
        return Err(PkiError::Integrity);
    }
    let mut r = Reader { buf: body, pos: 0 };
    if r.u32()? != MAGIC {
        return Err(PkiError::Malformed("bad magic".into()));
    }
    let version = r.u32()?;
    let count = r.u32()?;
    let mut entries = Vec::new();
    for _ in 0..count {
        let tag = r.u32()?;
        if tag != TAG_PRIVATE_KEY {
            return Err(PkiError::Malformed(format!("unsupported entry tag {}", tag)));
        }
        let alias = r.utf()?;
        let created_ms = r.u64()?;
        let len = r.u32()? as usize;
        let protected = unwrap_private_key_info(r.take(len)?)?;
        let key_pkcs8 = recover(protected, &pw)?;
        let mut chain = Vec::new();
        for _ in 0..r.u32()? {
            let _cert_type = r.utf()?;
            let len = r.u32()? as usize;
            chain.push(r.take(len)?.to_vec());
        }
        entries.push(KeystoreEntry { alias, created_ms, key_pkcs8, chain });
    }
    Ok(KeystoreSummary { version, entries })
}

/// `salt || key ^ keystream || SHA1(pw || key)`; the keystream is the chain
/// of `SHA1(pw || previous)` digests seeded with the salt.
fn protect(key: &[u8], pw: &[u8], salt: &[u8; DIGEST_LEN]) -> Vec<u8> {
    let mut out = Vec::with_capacity(DIGEST_LEN * 2 + key.len());
    out.extend_from_slice(salt);
    out.extend(key.iter().zip(keystream(pw, salt, key.len())).map(|(k, x)| k ^ x));
    out.extend(sha1(&[pw, key]));
    out
}

fn recover(protected: &[u8], pw: &[u8]) -> Result<Vec<u8>> {
    if protected.len() < DIGEST_LEN * 2 {
        return Err(PkiError::Malformed("protected key too short".into()));
    }
    let (salt, rest) = protected.split_at(DIGEST_LEN);
    let (encrypted, check) = rest.split_at(rest.len() - DIGEST_LEN);
    let key: Vec<u8> = encrypted.iter().zip(keystream(pw, salt, encrypted.len())).map(|(e, x)| e ^ x).collect();
    if sha1(&[pw, key.as_slice()]) != check {
        return Err(PkiError::Integrity);
    }
    Ok(key)
}

fn keystream(pw: &[u8], salt: &[u8], len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len + DIGEST_LEN);
    let mut digest = salt.to_vec();
    while out.len() < len {
        digest = sha1(&[pw, digest.as_slice()]).to_vec();
        out.extend_from_slice(&digest);
    }
    out.truncate(len);
    out
}

/// `EncryptedPrivateKeyInfo ::= SEQUENCE { AlgorithmIdentifier, OCTET STRING }`
fn encrypted_private_key_info(protected: &[u8]) -> Vec<u8> {
    let mut alg = KEY_PROTECTOR_OID.to_vec();
    alg.extend([0x05, 0x00]);
    let mut body = der(0x30, &alg);
    body.extend(der(0x04, protected));
    der(0x30, &body)
}

fn unwrap_private_key_info(info: &[u8]) -> Result<&[u8]> {
    let mut r = Reader { buf: info, pos: 0 };
    let outer = r.der(0x30)?;
    let mut r = Reader { buf: outer, pos: 0 };
    let alg = r.der(0x30)?;
    if !alg.starts_with(&KEY_PROTECTOR_OID) {
        return Err(PkiError::Malformed("unexpected key protection algorithm".into()));
    }
    r.der(0x04)
}

fn der(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut out = vec![tag];
    let len = content.len();
    if len < 0x80 {
        out.push(len as u8);
    } else {
        let bytes: Vec<u8> = len.to_be_bytes().into_iter().skip_while(|b| *b == 0).collect();
        out.push(0x80 | bytes.len() as u8);
        out.extend(bytes);
    }
    out.extend_from_slice(content);
    out
}

fn write_utf(out: &mut Vec<u8>, s: &str, what: &'static str) -> Result<()> {
    let len = u16::try_from(s.len()).map_err(|_| PkiError::TooLong(what))?;
    out.extend(len.to_be_bytes());
    out.extend(s.as_bytes());
    Ok(())
}

fn write_bytes(out: &mut Vec<u8>, b: &[u8], what: &'static str) -> Result<()> {
    let len = u32::try_from(b.len()).map_err(|_| PkiError::TooLong(what))?;
    out.extend(len.to_be_bytes());
    out.extend_from_slice(b);
    Ok(())
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(n).filter(|e| *e <= self.buf.len());
        match end {
            Some(end) => {
                let s = &self.buf[self.pos..end];
                self.pos = end;
                Ok(s)
            }
            None => Err(PkiError::Malformed(format!("truncated at offset {}", self.pos))),
        }
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64> {
        let hi = self.u32()? as u64;
        let lo = self.u32()? as u64;
        Ok(hi << 32 | lo)
    }

    fn utf(&mut self) -> Result<String> {
        let len = self.u16()? as usize;
        String::from_utf8(self.take(len)?.to_vec()).map_err(|e| PkiError::Malformed(e.to_string()))
    }

    fn der(&mut self, tag: u8) -> Result<&'a [u8]> {
        let t = self.take(1)?[0];
        if t != tag {
            return Err(PkiError::Malformed(format!("expected DER tag {:#x}, found {:#x}", tag, t)));
        }
        let first = self.take(1)?[0];
        let len = if first < 0x80 {
            first as usize
        } else {
            self.take((first & 0x7F) as usize)?.iter().fold(0usize, |acc, b| acc << 8 | *b as usize)
        };
        self.take(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(key: &[u8]) -> KeystoreEntry {
        KeystoreEntry { alias: "jboss".into(), created_ms: 1_560_000_000_000, key_pkcs8: key.to_vec(), chain: vec![vec![0x30, 0x00]] }
    }

    #[test]
    fn header_layout() {
        let bytes = encode(&[entry(b"k")], "pw", &[7; DIGEST_LEN]).unwrap();
        assert_eq!(&bytes[0..4], &MAGIC.to_be_bytes());
        assert_eq!(&bytes[4..8], &2u32.to_be_bytes());
        assert_eq!(&bytes[8..12], &1u32.to_be_bytes());
        assert_eq!(&bytes[12..16], &TAG_PRIVATE_KEY.to_be_bytes());
        assert_eq!(&bytes[16..18], &5u16.to_be_bytes());
        assert_eq!(&bytes[18..23], b"jboss");
    }

    #[test]
    fn protection_hides_key_and_recovers_it() {
        let key: Vec<u8> = (0..70u8).collect();
        let salt = [3u8; DIGEST_LEN];
        let pw = password_bytes("pw");
        let protected = protect(&key, &pw, &salt);
        assert_eq!(protected.len(), key.len() + 2 * DIGEST_LEN);
        assert_ne!(&protected[DIGEST_LEN..DIGEST_LEN + key.len()], key.as_slice());
        assert_eq!(recover(&protected, &pw).unwrap(), key);
        assert!(matches!(recover(&protected, &password_bytes("other")), Err(PkiError::Integrity)));
    }

    #[test]
    fn long_der_lengths() {
        let content = vec![0u8; 300];
        let enc = der(0x04, &content);
        assert_eq!(&enc[..4], &[0x04, 0x82, 0x01, 0x2C]);
        let mut r = Reader { buf: &enc, pos: 0 };
        assert_eq!(r.der(0x04).unwrap().len(), 300);
    }

    #[test]
    fn tampering_is_detected() {
        let mut bytes = encode(&[entry(b"key")], "pw", &[1; DIGEST_LEN]).unwrap();
        bytes[20] ^= 0xFF;
        assert!(matches!(inspect(&bytes, "pw"), Err(PkiError::Integrity)));
    }
}
