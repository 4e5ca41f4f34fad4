//! Minimal git packet-line support.
//!
//! Only what the proxy itself needs: framing the service preamble and `ERR`
//! packets, and reading the negotiation lines out of an upload-pack request.
//!
//! # Packet-line format
//!
//! Each packet line is prefixed with a 4-character hex length that includes
//! itself:
//!
//! - `0000` -- flush packet
//! - `0001` -- delimiter packet (protocol v2)
//! - `0002` -- response-end packet (protocol v2)
//! - `0004`+ -- data packet

use tracing::{trace, warn};

/// Largest packet git accepts, prefix included.
pub const MAX_PKT_LEN: usize = 65520;

pub const FLUSH: &[u8] = b"0000";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PktLine {
    Data(Vec<u8>),
    Flush,
    Delimiter,
    ResponseEnd,
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Frame `data` as one data packet.  Payloads too large for a single packet
/// are truncated.
pub fn encode_pkt_line(data: &[u8]) -> Vec<u8> {
    let data = if data.len() + 4 > MAX_PKT_LEN {
        warn!(len = data.len(), "truncating oversized packet-line");
        &data[..MAX_PKT_LEN - 4]
    } else {
        data
    };
    let total_len = data.len() + 4;
    let mut buf = Vec::with_capacity(total_len);
    buf.extend_from_slice(format!("{total_len:04x}").as_bytes());
    buf.extend_from_slice(data);
    buf
}

/// `ERR <message>` packet.  git prints the message and aborts the
/// operation.
pub fn error_packet(message: &str) -> Vec<u8> {
    let message = message.trim().replace('\n', " ");
    encode_pkt_line(format!("ERR {message}\n").as_bytes())
}

/// `# service=<service>` preamble of a v0 ref advertisement.
pub fn service_advertisement(service: &str) -> Vec<u8> {
    let mut buf = encode_pkt_line(format!("# service={service}\n").as_bytes());
    buf.extend_from_slice(FLUSH);
    buf
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Decode packet lines from `data`, stopping at the first malformed or
/// truncated one.
pub fn decode_pkt_lines(data: &[u8]) -> Vec<PktLine> {
    let mut packets = Vec::new();
    let mut pos = 0;

    while pos + 4 <= data.len() {
        let Some(pkt_len) = std::str::from_utf8(&data[pos..pos + 4])
            .ok()
            .and_then(|hex| usize::from_str_radix(hex, 16).ok())
        else {
            warn!(offset = pos, "invalid packet-line length prefix");
            break;
        };

        match pkt_len {
            0 => packets.push(PktLine::Flush),
            1 => packets.push(PktLine::Delimiter),
            2 => packets.push(PktLine::ResponseEnd),
            3 => {
                warn!(offset = pos, "invalid packet-line length 0003");
                break;
            }
            n => {
                if pos + n > data.len() {
                    trace!(offset = pos, declared = n, "truncated packet-line");
                    break;
                }
                packets.push(PktLine::Data(data[pos + 4..pos + n].to_vec()));
                pos += n;
                continue;
            }
        }
        pos += 4;
    }

    packets
}

/// The parts of an upload-pack request that determine its response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadRequest {
    pub wants: Vec<String>,
    pub haves: Vec<String>,
    /// Capabilities and arguments other than `want`/`have`, minus the ones
    /// that only identify the client (`agent=`, `session-id=`).
    pub args: Vec<String>,
    pub done: bool,
    /// `want-ref` or `deepen-not`: the answer depends on where refs point.
    pub names_refs: bool,
}

impl UploadRequest {
    /// Read a v0 or v2 upload-pack request body.
    pub fn parse(body: &[u8]) -> Self {
        let mut request = UploadRequest::default();
        for pkt in decode_pkt_lines(body) {
            let PktLine::Data(data) = pkt else { continue };
            let line = String::from_utf8_lossy(&data);
            let line = line.trim_end_matches('\n');
            let mut words = line.split([' ', '\0']).filter(|w| !w.is_empty());
            match words.next() {
                Some("want") => {
                    if let Some(oid) = words.next().filter(|oid| is_object_id(oid)) {
                        request.wants.push(oid.to_ascii_lowercase());
                    }
                    // v0 carries capabilities on the first want line.
                    request.args.extend(words.filter(|w| is_relevant_arg(w)).map(str::to_owned));
                }
                Some("have") => {
                    if let Some(oid) = words.next().filter(|oid| is_object_id(oid)) {
                        request.haves.push(oid.to_ascii_lowercase());
                    }
                }
                Some("done") => request.done = true,
                Some("want-ref") | Some("deepen-not") => {
                    request.names_refs = true;
                    request.args.push(line.to_string());
                }
                Some(_) if is_relevant_arg(line) => request.args.push(line.to_string()),
                _ => {}
            }
        }
        for list in [&mut request.wants, &mut request.haves, &mut request.args] {
            list.sort();
            list.dedup();
        }
        request
    }

    /// Whether the response is fully determined by the request and the
    /// objects named in it, and ends in a flush packet (v2, or v0 with
    /// side-band).
    pub fn cacheable(&self) -> bool {
        let framed = self
            .args
            .iter()
            .any(|a| a == "command=fetch" || a.starts_with("side-band"));
        self.done && framed && !self.wants.is_empty() && !self.names_refs
    }
}

fn is_relevant_arg(word: &str) -> bool {
    !(word.starts_with("agent=") || word.starts_with("session-id="))
}

fn is_object_id(s: &str) -> bool {
    matches!(s.len(), 40 | 64) && s.bytes().all(|b| b.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;

    const OID_A: &str = "1111111111111111111111111111111111111111";
    const OID_B: &str = "2222222222222222222222222222222222222222";

    #[test]
    fn encodes_with_length_prefix() {
        assert_eq!(encode_pkt_line(b"a\n"), b"0006a\n");
        assert_eq!(
            service_advertisement("git-upload-pack"),
            b"001e# service=git-upload-pack\n0000".to_vec()
        );
    }

    #[test]
    fn error_packet_is_single_line() {
        let pkt = error_packet("upstream unavailable\nretry later\n");
        assert_eq!(pkt, encode_pkt_line(b"ERR upstream unavailable retry later\n"));
    }

    #[test]
    fn oversized_payload_is_truncated() {
        let pkt = encode_pkt_line(&vec![b'x'; 70_000]);
        assert_eq!(pkt.len(), MAX_PKT_LEN);
        assert_eq!(&pkt[..4], b"fff0");
    }

    #[test]
    fn decodes_special_packets_and_stops_on_garbage() {
        let data = b"0000000100020006a\nzzzz0006b\n";
        assert_eq!(
            decode_pkt_lines(data),
            vec![
                PktLine::Flush,
                PktLine::Delimiter,
                PktLine::ResponseEnd,
                PktLine::Data(b"a\n".to_vec()),
            ]
        );
    }

    #[test]
    fn wants_from_v0_request() {
        let mut body = encode_pkt_line(
            format!("want {OID_A} multi_ack_detailed side-band-64k ofs-delta\n").as_bytes(),
        );
        body.extend(encode_pkt_line(format!("want {OID_B}\n").as_bytes()));
        body.extend_from_slice(FLUSH);
        body.extend(encode_pkt_line(format!("have {OID_B}\n").as_bytes()));
        body.extend(encode_pkt_line(b"done\n"));

        assert_eq!(UploadRequest::parse(&body).wants, vec![OID_A.to_string(), OID_B.to_string()]);
    }

    #[test]
    fn wants_from_v2_fetch() {
        let mut body = encode_pkt_line(b"command=fetch\n");
        body.extend(encode_pkt_line(b"agent=git/2.43.0\n"));
        body.extend_from_slice(b"0001");
        body.extend(encode_pkt_line(b"thin-pack\n"));
        body.extend(encode_pkt_line(format!("want {}\n", OID_A.to_uppercase()).as_bytes()));
        body.extend(encode_pkt_line(b"want-ref refs/heads/main\n"));
        body.extend(encode_pkt_line(b"done\n"));
        body.extend_from_slice(FLUSH);

        assert_eq!(UploadRequest::parse(&body).wants, vec![OID_A.to_string()]);
    }

    #[test]
    fn upload_request_ignores_client_identity() {
        let mut first = encode_pkt_line(
            format!("want {OID_B} side-band-64k ofs-delta agent=git/2.39.0\n").as_bytes(),
        );
        first.extend(encode_pkt_line(format!("want {OID_A}\n").as_bytes()));
        first.extend_from_slice(FLUSH);
        first.extend(encode_pkt_line(b"done\n"));

        let mut second = encode_pkt_line(
            format!("want {OID_A} ofs-delta side-band-64k agent=git/2.43.0\n").as_bytes(),
        );
        second.extend(encode_pkt_line(format!("want {OID_B}\n").as_bytes()));
        second.extend_from_slice(FLUSH);
        second.extend(encode_pkt_line(b"done\n"));

        let parsed = UploadRequest::parse(&first);
        assert_eq!(parsed, UploadRequest::parse(&second));
        assert_eq!(parsed.wants, vec![OID_A.to_string(), OID_B.to_string()]);
        assert_eq!(parsed.args, vec!["ofs-delta".to_string(), "side-band-64k".to_string()]);
        assert!(parsed.cacheable());
    }

    #[test]
    fn upload_request_cacheability() {
        let mut v2 = encode_pkt_line(b"command=fetch\n");
        v2.extend(encode_pkt_line(b"agent=git/2.43.0\n"));
        v2.extend(encode_pkt_line(b"session-id=abc\n"));
        v2.extend_from_slice(b"0001");
        v2.extend(encode_pkt_line(format!("want {OID_A}\n").as_bytes()));
        v2.extend(encode_pkt_line(format!("have {OID_B}\n").as_bytes()));
        let negotiating = UploadRequest::parse(&v2);
        assert_eq!(negotiating.args, vec!["command=fetch".to_string()]);
        assert_eq!(negotiating.haves, vec![OID_B.to_string()]);
        assert!(!negotiating.cacheable());

        v2.extend(encode_pkt_line(b"done\n"));
        assert!(UploadRequest::parse(&v2).cacheable());

        let mut by_ref = v2.clone();
        by_ref.extend(encode_pkt_line(b"want-ref refs/heads/main\n"));
        assert!(!UploadRequest::parse(&by_ref).cacheable());

        let mut unframed = encode_pkt_line(format!("want {OID_A} ofs-delta\n").as_bytes());
        unframed.extend_from_slice(FLUSH);
        unframed.extend(encode_pkt_line(b"done\n"));
        assert!(!UploadRequest::parse(&unframed).cacheable());

        let mut only_refs = encode_pkt_line(b"command=fetch\n");
        only_refs.extend(encode_pkt_line(b"done\n"));
        assert!(!UploadRequest::parse(&only_refs).cacheable());
    }

    #[test]
    fn ignores_malformed_wants() {
        let body = encode_pkt_line(b"want not-an-oid\n");
        assert!(UploadRequest::parse(&body).wants.is_empty());
    }
}
