//! Standalone RFC 9001 QUIC Initial-packet decoder.
//!
//! The engine's own handshake handler never sees these bytes: this module
//! derives the well-known Initial secrets from the packet's destination
//! connection ID, removes header protection, opens the Initial AEAD, and
//! picks the ClientHello's SNI and ALPN offers out of the recovered CRYPTO
//! frame. No connection state is created or advanced — this replaces the
//! engine-monkeypatching trick the original implementation used (see
//! DESIGN.md).

use ring::aead::quic::{self, HeaderProtectionKey};
use ring::aead::{self, LessSafeKey, UnboundKey};
use ring::hkdf::{self, HKDF_SHA256};

use crate::error::{CoreError, CoreResult};

/// The QUIC v1 Initial salt (RFC 9001 §5.2).
const INITIAL_SALT_V1: [u8; 20] = [
    0x38, 0x76, 0x2c, 0xf7, 0xf5, 0x59, 0x34, 0xb3, 0x4d, 0x17, 0x9a, 0xe6, 0xa4, 0xc8, 0x0c, 0xad,
    0xcc, 0xbb, 0x7f, 0x0a,
];

pub const QUIC_VERSION_1: u32 = 0x0000_0001;

/// SNI and ALPN offers recovered from a ClientHello, plus the raw connection
/// IDs off the same Initial packet (the caller uses these to key the
/// connection-ID table and to drive `start_tls`).
#[derive(Debug, Clone)]
pub struct ClientHelloInfo {
    pub sni: Option<String>,
    pub alpn_protocols: Vec<Vec<u8>>,
    pub destination_cid: Vec<u8>,
    pub source_cid: Vec<u8>,
    pub version: u32,
}

/// Just the long-header fields needed to decide whether a first packet's
/// QUIC version is supported, without attempting Initial decryption — the
/// version and connection IDs sit in cleartext before the (still
/// header-protected) packet number, so this is cheap and always available
/// even for a version this adapter cannot decrypt.
#[derive(Debug, Clone)]
pub struct LongHeaderPrefix {
    pub version: u32,
    pub destination_cid: Vec<u8>,
    pub source_cid: Vec<u8>,
}

/// Read the version and connection IDs off a long-header packet's cleartext
/// prefix. Returns `InvalidDatagram` if the bytes are not a long-header
/// packet at all.
pub fn peek_long_header(packet: &[u8]) -> CoreResult<LongHeaderPrefix> {
    if packet.is_empty() || packet[0] & 0x80 == 0 {
        return Err(CoreError::InvalidDatagram("not a long-header packet".into()));
    }
    let mut cur = Cursor::new(packet);
    cur.u8()?; // first byte, protected bits aside from the long-header bit are irrelevant here
    let (version, destination_cid, source_cid) = parse_long_header_ids(&mut cur)?;
    Ok(LongHeaderPrefix { version, destination_cid, source_cid })
}

/// Shared by `peek_long_header` and `parse_client_hello`: the version and
/// connection ID fields immediately following the first byte.
fn parse_long_header_ids(cur: &mut Cursor) -> CoreResult<(u32, Vec<u8>, Vec<u8>)> {
    let version = {
        let b = cur.take(4)?;
        u32::from_be_bytes([b[0], b[1], b[2], b[3]])
    };
    let dcid_len = cur.u8()? as usize;
    let dcid = cur.take(dcid_len)?.to_vec();
    let scid_len = cur.u8()? as usize;
    let scid = cur.take(scid_len)?.to_vec();
    Ok((version, dcid, scid))
}

/// Build a Version Negotiation packet (RFC 9000 §17.2.1) in response to an
/// Initial carrying a version this adapter does not speak. `their_dcid` and
/// `their_scid` are the connection IDs from the rejected packet; they are
/// echoed back swapped, as the client has no established IDs of its own yet.
pub fn build_version_negotiation_packet(their_dcid: &[u8], their_scid: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(1 + 4 + 1 + their_scid.len() + 1 + their_dcid.len() + 4);
    packet.push(0x80 | 0x7f); // long-header bit set; remaining bits are unspecified for version negotiation
    packet.extend_from_slice(&0u32.to_be_bytes()); // version 0 marks this as a version-negotiation packet
    packet.push(their_scid.len() as u8);
    packet.extend_from_slice(their_scid);
    packet.push(their_dcid.len() as u8);
    packet.extend_from_slice(their_dcid);
    packet.extend_from_slice(&QUIC_VERSION_1.to_be_bytes());
    packet
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> CoreResult<&'a [u8]> {
        if self.remaining() < n {
            return Err(CoreError::InvalidDatagram("truncated".into()));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> CoreResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> CoreResult<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u24(&mut self) -> CoreResult<u32> {
        let b = self.take(3)?;
        Ok(u32::from_be_bytes([0, b[0], b[1], b[2]]))
    }

    /// QUIC variable-length integer (RFC 9000 §16).
    fn varint(&mut self) -> CoreResult<u64> {
        let first = self.u8()?;
        let len = 1usize << (first >> 6);
        let mut value = (first & 0x3f) as u64;
        for _ in 1..len {
            value = (value << 8) | self.u8()? as u64;
        }
        Ok(value)
    }
}

fn hkdf_expand_label(secret: &hkdf::Prk, label: &str, out_len: usize) -> CoreResult<Vec<u8>> {
    // TLS 1.3 HkdfLabel (RFC 8446 §7.1) as used by RFC 9001's Initial-secret
    // derivation: 2-byte length, length-prefixed "tls13 " + label, zero-length context.
    let full_label = format!("tls13 {label}");
    let mut info = Vec::with_capacity(2 + 1 + full_label.len() + 1);
    info.extend_from_slice(&(out_len as u16).to_be_bytes());
    info.push(full_label.len() as u8);
    info.extend_from_slice(full_label.as_bytes());
    info.push(0); // empty context

    struct Len(usize);
    impl hkdf::KeyType for Len {
        fn len(&self) -> usize {
            self.0
        }
    }

    let okm = secret
        .expand(&[&info], Len(out_len))
        .map_err(|_| CoreError::ClientHelloParse("hkdf-expand-label failed".into()))?;
    let mut out = vec![0u8; out_len];
    okm.fill(&mut out)
        .map_err(|_| CoreError::ClientHelloParse("hkdf fill failed".into()))?;
    Ok(out)
}

/// Derive the client-direction Initial key, IV, and header-protection key
/// for `destination_cid`, matching RFC 9001 Appendix A.1's worked example.
pub fn derive_client_initial_keys(destination_cid: &[u8]) -> CoreResult<([u8; 16], [u8; 12], [u8; 16])> {
    let salt = hkdf::Salt::new(HKDF_SHA256, &INITIAL_SALT_V1);
    let initial_secret = salt.extract(destination_cid);

    let client_secret_bytes = hkdf_expand_label(&initial_secret, "client in", 32)?;
    let client_secret = hkdf::Prk::new_less_safe(HKDF_SHA256, &client_secret_bytes);

    let key_bytes = hkdf_expand_label(&client_secret, "quic key", 16)?;
    let iv_bytes = hkdf_expand_label(&client_secret, "quic iv", 12)?;
    let hp_bytes = hkdf_expand_label(&client_secret, "quic hp", 16)?;

    let mut key = [0u8; 16];
    key.copy_from_slice(&key_bytes);
    let mut iv = [0u8; 12];
    iv.copy_from_slice(&iv_bytes);
    let mut hp = [0u8; 16];
    hp.copy_from_slice(&hp_bytes);

    Ok((key, iv, hp))
}

fn xor_iv(iv: &[u8; 12], packet_number: u64, pn_len: usize) -> [u8; 12] {
    let mut nonce = *iv;
    let pn_bytes = packet_number.to_be_bytes();
    for i in 0..pn_len {
        nonce[12 - pn_len + i] ^= pn_bytes[8 - pn_len + i];
    }
    nonce
}

/// Parse an Initial packet's long header, derive keys, remove header
/// protection, decrypt the payload, and extract the ClientHello's SNI and
/// ALPN offers. Returns `InvalidDatagram` if the bytes are not a long-header
/// Initial packet, `ClientHelloParse` for any later failure.
pub fn parse_client_hello(packet: &[u8]) -> CoreResult<ClientHelloInfo> {
    if packet.is_empty() || packet[0] & 0x80 == 0 {
        return Err(CoreError::InvalidDatagram("not a long-header packet".into()));
    }

    let mut cur = Cursor::new(packet);
    let first_byte_offset = cur.pos;
    let first_byte_protected = cur.u8()?;
    let (version, dcid, scid) = parse_long_header_ids(&mut cur)?;

    if version == 0 {
        return Err(CoreError::InvalidDatagram("version negotiation packet".into()));
    }
    if version != QUIC_VERSION_1 {
        return Err(CoreError::UnsupportedVersion(version));
    }

    // Only an Initial packet carries a token; the packet-type bits are
    // still header-protected at this point, but Initial is the only
    // long-header type with a token field, and version negotiation is
    // already excluded above, so a token field is always present at this
    // parse stage for the packet types this decoder accepts.
    let token_len = cur.varint()? as usize;
    let _token = cur.take(token_len)?;

    let payload_len = cur.varint()? as usize;
    let pn_offset = cur.pos;

    if cur.remaining() < payload_len {
        return Err(CoreError::InvalidDatagram("payload shorter than declared length".into()));
    }
    let packet_end = pn_offset + payload_len;

    let (key, iv, hp) = derive_client_initial_keys(&dcid)?;

    // Header protection sample starts 4 bytes into the (still-unknown-length)
    // packet number field, per RFC 9001 §5.4.2.
    if packet.len() < pn_offset + 4 + 16 {
        return Err(CoreError::ClientHelloParse("packet too short for hp sample".into()));
    }
    let sample = &packet[pn_offset + 4..pn_offset + 4 + 16];

    let hp_key = HeaderProtectionKey::new(&quic::AES_128, &hp)
        .map_err(|_| CoreError::ClientHelloParse("invalid header protection key".into()))?;
    let mask = hp_key
        .new_mask(sample)
        .map_err(|_| CoreError::ClientHelloParse("header protection mask failed".into()))?;

    let mut first_byte = first_byte_protected;
    first_byte ^= mask[0] & 0x0f;
    let pn_len = (first_byte & 0x03) as usize + 1;

    let mut pn_bytes = packet[pn_offset..pn_offset + pn_len].to_vec();
    for (i, b) in pn_bytes.iter_mut().enumerate() {
        *b ^= mask[1 + i];
    }
    let mut pn_padded = [0u8; 8];
    pn_padded[8 - pn_len..].copy_from_slice(&pn_bytes);
    let packet_number = u64::from_be_bytes(pn_padded);

    let mut header = packet[first_byte_offset..pn_offset].to_vec();
    header[0] = first_byte;
    header.extend_from_slice(&pn_bytes);

    let ciphertext_start = pn_offset + pn_len;
    let mut payload = packet[ciphertext_start..packet_end].to_vec();

    let nonce_bytes = xor_iv(&iv, packet_number, pn_len);
    let unbound = UnboundKey::new(&aead::AES_128_GCM, &key)
        .map_err(|_| CoreError::ClientHelloParse("invalid AEAD key".into()))?;
    let sealing_key = LessSafeKey::new(unbound);
    let nonce = aead::Nonce::assume_unique_for_key(nonce_bytes);

    let plaintext = sealing_key
        .open_in_place(nonce, aead::Aad::from(&header), &mut payload)
        .map_err(|_| CoreError::ClientHelloParse("AEAD decryption failed".into()))?;

    let crypto_data = extract_crypto_frame(plaintext)?;
    let (sni, alpn_protocols) = parse_client_hello_record(&crypto_data)?;

    Ok(ClientHelloInfo {
        sni,
        alpn_protocols,
        destination_cid: dcid,
        source_cid: scid,
        version,
    })
}

/// Walk the decrypted Initial payload's frames and concatenate the bytes of
/// any CRYPTO frame(s) found. A single Initial packet with a normal-sized
/// ClientHello carries the whole handshake message in one CRYPTO frame
/// starting at offset 0; reassembly across multiple Initial packets is not
/// attempted here since each call decodes exactly one packet.
fn extract_crypto_frame(payload: &[u8]) -> CoreResult<Vec<u8>> {
    let mut cur = Cursor::new(payload);
    while cur.remaining() > 0 {
        let frame_type = cur.varint()?;
        match frame_type {
            0x00 => continue,       // PADDING
            0x01 => continue,       // PING
            0x06 => {
                // CRYPTO { offset, length, data }
                let offset = cur.varint()?;
                let length = cur.varint()? as usize;
                let data = cur.take(length)?;
                if offset == 0 {
                    return Ok(data.to_vec());
                }
                // a fragment that doesn't start the handshake message; not
                // reconstructible from a single packet.
                continue;
            }
            0x02 | 0x03 => {
                // ACK frame; skip its variable-length fields.
                let _largest = cur.varint()?;
                let _delay = cur.varint()?;
                let range_count = cur.varint()?;
                let _first_range = cur.varint()?;
                for _ in 0..range_count {
                    let _gap = cur.varint()?;
                    let _len = cur.varint()?;
                }
                if frame_type == 0x03 {
                    let _ect0 = cur.varint()?;
                    let _ect1 = cur.varint()?;
                    let _ce = cur.varint()?;
                }
            }
            0x1c | 0x1d => {
                // CONNECTION_CLOSE
                let _error_code = cur.varint()?;
                if frame_type == 0x1c {
                    let _frame_type = cur.varint()?;
                }
                let reason_len = cur.varint()? as usize;
                let _reason = cur.take(reason_len)?;
            }
            _ => {
                return Err(CoreError::ClientHelloParse(format!(
                    "unexpected frame type {frame_type:#x} before CRYPTO"
                )));
            }
        }
    }
    Err(CoreError::ClientHelloParse("no CRYPTO frame found".into()))
}

const TLS_EXT_SERVER_NAME: u16 = 0x0000;
const TLS_EXT_ALPN: u16 = 0x0010;

/// Parse just enough of a TLS 1.3 ClientHello handshake message to pull out
/// the SNI host_name and the ALPN protocol list.
fn parse_client_hello_record(handshake: &[u8]) -> CoreResult<(Option<String>, Vec<Vec<u8>>)> {
    let mut cur = Cursor::new(handshake);

    let msg_type = cur.u8()?;
    if msg_type != 0x01 {
        return Err(CoreError::ClientHelloParse(format!(
            "expected ClientHello handshake type, got {msg_type:#x}"
        )));
    }
    let _len = cur.u24()?;

    let _legacy_version = cur.u16()?;
    let _random = cur.take(32)?;

    let session_id_len = cur.u8()? as usize;
    cur.take(session_id_len)?;

    let cipher_suites_len = cur.u16()? as usize;
    cur.take(cipher_suites_len)?;

    let compression_len = cur.u8()? as usize;
    cur.take(compression_len)?;

    let mut sni = None;
    let mut alpn = Vec::new();

    if cur.remaining() == 0 {
        // Extensions are technically optional; a ClientHello without ALPN
        // or SNI is valid, just not very useful to the policy layer.
        return Ok((sni, alpn));
    }

    let extensions_len = cur.u16()? as usize;
    let extensions_end = cur.pos + extensions_len;

    while cur.pos < extensions_end {
        let ext_type = cur.u16()?;
        let ext_len = cur.u16()? as usize;
        let ext_data = cur.take(ext_len)?;

        match ext_type {
            TLS_EXT_SERVER_NAME => {
                sni = parse_sni(ext_data)?;
            }
            TLS_EXT_ALPN => {
                alpn = parse_alpn(ext_data)?;
            }
            _ => {}
        }
    }

    Ok((sni, alpn))
}

fn parse_sni(data: &[u8]) -> CoreResult<Option<String>> {
    let mut cur = Cursor::new(data);
    if cur.remaining() < 2 {
        return Ok(None);
    }
    let list_len = cur.u16()? as usize;
    let list_end = cur.pos + list_len.min(cur.remaining());
    while cur.pos < list_end {
        let name_type = cur.u8()?;
        let name_len = cur.u16()? as usize;
        let name = cur.take(name_len)?;
        if name_type == 0x00 {
            return Ok(Some(
                String::from_utf8(name.to_vec())
                    .map_err(|_| CoreError::ClientHelloParse("SNI hostname not UTF-8".into()))?,
            ));
        }
    }
    Ok(None)
}

fn parse_alpn(data: &[u8]) -> CoreResult<Vec<Vec<u8>>> {
    let mut cur = Cursor::new(data);
    let list_len = cur.u16()? as usize;
    let list_end = cur.pos + list_len.min(cur.remaining());
    let mut protocols = Vec::new();
    while cur.pos < list_end {
        let proto_len = cur.u8()? as usize;
        let proto = cur.take(proto_len)?;
        protocols.push(proto.to_vec());
    }
    Ok(protocols)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// RFC 9001 Appendix A.1's worked example: DCID = 0x8394c8f03e515708.
    #[test]
    fn rfc9001_appendix_a1_key_derivation() {
        let dcid = [0x83, 0x94, 0xc8, 0xf0, 0x3e, 0x51, 0x57, 0x08];
        let (key, iv, hp) = derive_client_initial_keys(&dcid).unwrap();

        assert_eq!(key, [0x1f, 0x36, 0x96, 0x13, 0xdd, 0x76, 0xd5, 0x46, 0x77, 0x30, 0xef, 0xcb, 0xe3, 0xb1, 0xa2, 0x2d]);
        assert_eq!(iv, [0xfa, 0x04, 0x4b, 0x2f, 0x42, 0xa3, 0xfd, 0x3b, 0x46, 0xfb, 0x25, 0x5c]);
        assert_eq!(hp, [0x9f, 0x50, 0x44, 0x9e, 0x04, 0xa0, 0xe8, 0x10, 0x28, 0x3a, 0x1e, 0x99, 0x33, 0xad, 0xed, 0xd2]);
    }

    #[test]
    fn non_long_header_packet_rejected() {
        let err = parse_client_hello(&[0x00, 0x01, 0x02]).unwrap_err();
        assert!(matches!(err, CoreError::InvalidDatagram(_)));
    }

    #[test]
    fn version_negotiation_packet_rejected_as_invalid() {
        let mut pkt = vec![0x80u8];
        pkt.extend_from_slice(&[0, 0, 0, 0]); // version = 0
        pkt.extend_from_slice(&[0x00, 0x00]); // empty dcid/scid lengths
        let err = parse_client_hello(&pkt).unwrap_err();
        assert!(matches!(err, CoreError::InvalidDatagram(_)));
    }

    #[test]
    fn alpn_extension_parses_protocol_list() {
        // protocol list length (2) + one entry: len-prefixed "h3"
        let data = [0x00, 0x03, 0x02, b'h', b'3'];
        let protos = parse_alpn(&data).unwrap();
        assert_eq!(protos, vec![b"h3".to_vec()]);
    }

    #[test]
    fn sni_extension_parses_hostname() {
        let mut data = vec![0x00, 0x00]; // server name list length (filled below)
        let mut entry = vec![0x00]; // name_type = host_name
        let host = b"example.com";
        entry.extend_from_slice(&(host.len() as u16).to_be_bytes());
        entry.extend_from_slice(host);
        let list_len = entry.len() as u16;
        data[0..2].copy_from_slice(&list_len.to_be_bytes());
        data.extend_from_slice(&entry);

        let sni = parse_sni(&data).unwrap();
        assert_eq!(sni.as_deref(), Some("example.com"));
    }
}
