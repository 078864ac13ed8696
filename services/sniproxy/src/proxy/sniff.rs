//! Hostname extraction from the first bytes of a connection.
//!
//! TLS connections are identified by the Server Name Indication extension
//! of the ClientHello. Anything that does not start with a TLS handshake
//! record is scanned as plaintext HTTP for a `Host:` header.
//!
//! The decoder only looks at the buffer it is given. A ClientHello that
//! spills past the initial read is reported as truncated, never reassembled.

use thiserror::Error;
use tracing::debug;

/// Default number of bytes read from a new connection before sniffing.
pub const DEFAULT_INITIAL_READ_SIZE: usize = 1024;

const RECORD_TYPE_HANDSHAKE: u8 = 22;
const HANDSHAKE_TYPE_CLIENT_HELLO: u8 = 1;
const TLS_MAJOR_VERSION: u8 = 3;
const RECORD_HEADER_LEN: usize = 5;
const EXTENSION_SERVER_NAME: u16 = 0;
const NAME_TYPE_HOST_NAME: u8 = 0;

const HOST_HEADER: &[u8] = b"\r\nHost: ";

/// Reason a TLS ClientHello could not yield a hostname.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SniError {
    #[error("unsupported TLS major version {0}")]
    UnsupportedVersion(u8),

    #[error("handshake message type {0} is not ClientHello")]
    NotClientHello(u8),

    #[error("truncated {0}")]
    Truncated(&'static str),

    #[error("no server name in ClientHello")]
    NoServerName,

    #[error("server name is not valid UTF-8")]
    InvalidHostname,
}

/// Outcome of decoding a TLS ClientHello.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SniResult {
    /// First host_name entry of the SNI extension.
    Found(String),
    /// Not a TLS handshake record, or too short to be one.
    NotTls,
    /// A TLS handshake that could not be decoded.
    Failed(SniError),
}

/// Identity extracted from a connection's initial bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sniffed {
    Sni(String),
    HttpHost(String),
    /// No hostname could be determined.
    Unknown,
}

impl Sniffed {
    /// Borrow the hostname, if one was found.
    pub fn hostname(&self) -> Option<&str> {
        match self {
            Sniffed::Sni(h) | Sniffed::HttpHost(h) => Some(h),
            Sniffed::Unknown => None,
        }
    }

    pub fn into_hostname(self) -> Option<String> {
        match self {
            Sniffed::Sni(h) | Sniffed::HttpHost(h) => Some(h),
            Sniffed::Unknown => None,
        }
    }

    /// Short label for logging where the identity came from.
    pub fn source(&self) -> &'static str {
        match self {
            Sniffed::Sni(_) => "sni",
            Sniffed::HttpHost(_) => "http_host",
            Sniffed::Unknown => "none",
        }
    }
}

/// Best-effort hostname for a connection, `None` when undetermined.
pub fn identify(buf: &[u8]) -> Option<String> {
    sniff(buf).into_hostname()
}

/// Classify the initial bytes and extract a hostname.
///
/// A TLS decode failure does not fall back to the HTTP scan; only input
/// that is not recognisably TLS does.
pub fn sniff(buf: &[u8]) -> Sniffed {
    let sniffed = match parse_client_hello(buf) {
        SniResult::Found(host) => Sniffed::Sni(host),
        SniResult::NotTls => match http_host(buf) {
            Some(host) => Sniffed::HttpHost(host),
            None => {
                debug!("no Host header in initial bytes");
                Sniffed::Unknown
            }
        },
        SniResult::Failed(reason) => {
            debug!(reason = %reason, "ClientHello decode failed");
            Sniffed::Unknown
        }
    };

    // An empty name carries no routing information.
    match sniffed.hostname() {
        Some("") => Sniffed::Unknown,
        _ => sniffed,
    }
}

/// Scan for a `\r\nHost: <value>\r\n` line.
///
/// Matching is case-sensitive and expects exactly one space after the
/// colon. The value runs to the CR of the line's terminating CRLF. A
/// candidate line without that terminator is skipped and the scan resumes
/// after it.
pub fn http_host(buf: &[u8]) -> Option<String> {
    let mut offset = 0;

    while let Some(pos) = buf[offset..]
        .windows(HOST_HEADER.len())
        .position(|w| w == HOST_HEADER)
    {
        let start = offset + pos + HOST_HEADER.len();
        let rest = &buf[start..];
        let line_end = rest.iter().position(|&b| b == b'\n')?;

        if let Some(line) = rest[..line_end].strip_suffix(b"\r") {
            return std::str::from_utf8(line).ok().map(str::to_owned);
        }

        offset = start + line_end;
    }

    None
}

/// Decode the SNI host name from a TLS record carrying a ClientHello.
///
/// Record header:
/// - byte 0: content type (22 = handshake)
/// - bytes 1-2: version (major must be 3)
/// - bytes 3-4: record length
///
/// Handshake header (byte 5 on): type (1 = ClientHello), 3-byte length.
///
/// ClientHello body: version (2), random (32), session id (u8 length),
/// cipher suites (u16 length), compression methods (u8 length),
/// extensions (u16 length).
pub fn parse_client_hello(buf: &[u8]) -> SniResult {
    if buf.first() != Some(&RECORD_TYPE_HANDSHAKE) || buf.len() < RECORD_HEADER_LEN {
        return SniResult::NotTls;
    }

    if buf[1] != TLS_MAJOR_VERSION {
        return SniResult::Failed(SniError::UnsupportedVersion(buf[1]));
    }

    match decode_handshake(&buf[RECORD_HEADER_LEN..]) {
        Ok(host) => SniResult::Found(host),
        Err(e) => SniResult::Failed(e),
    }
}

fn decode_handshake(data: &[u8]) -> Result<String, SniError> {
    let mut r = Reader::new(data);

    let msg_type = r.u8("handshake header")?;
    if msg_type != HANDSHAKE_TYPE_CLIENT_HELLO {
        return Err(SniError::NotClientHello(msg_type));
    }

    let len = r.u24("handshake header")?;
    let mut hello = Reader::new(r.take(len, "ClientHello")?);

    hello.skip(2, "client version")?;
    hello.skip(32, "random")?;

    let session_id_len = hello.u8("session id")? as usize;
    hello.skip(session_id_len, "session id")?;

    let cipher_suites_len = hello.u16("cipher suites")? as usize;
    hello.skip(cipher_suites_len, "cipher suites")?;

    let compression_len = hello.u8("compression methods")? as usize;
    hello.skip(compression_len, "compression methods")?;

    if hello.is_empty() {
        // Extensions are optional in a ClientHello.
        return Err(SniError::NoServerName);
    }

    let extensions_len = hello.u16("extensions")? as usize;
    let mut extensions = Reader::new(hello.take(extensions_len, "extensions")?);

    while !extensions.is_empty() {
        let ext_type = extensions.u16("extension header")?;
        let ext_len = extensions.u16("extension header")? as usize;
        let payload = extensions.take(ext_len, "extension")?;

        if ext_type == EXTENSION_SERVER_NAME {
            return decode_server_name(payload);
        }
    }

    Err(SniError::NoServerName)
}

/// ServerNameList: u16 length, then (u8 name type, u16 length, name).
fn decode_server_name(payload: &[u8]) -> Result<String, SniError> {
    let mut r = Reader::new(payload);
    let list_len = r.u16("server name list")? as usize;
    let mut list = Reader::new(r.take(list_len, "server name list")?);

    while !list.is_empty() {
        let name_type = list.u8("server name entry")?;
        let name_len = list.u16("server name entry")? as usize;
        let name = list.take(name_len, "server name")?;

        if name_type == NAME_TYPE_HOST_NAME {
            return std::str::from_utf8(name)
                .map(str::to_owned)
                .map_err(|_| SniError::InvalidHostname);
        }
    }

    Err(SniError::NoServerName)
}

/// Bounds-checked cursor over a byte slice.
struct Reader<'a> {
    data: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn take(&mut self, n: usize, what: &'static str) -> Result<&'a [u8], SniError> {
        if n > self.data.len() {
            return Err(SniError::Truncated(what));
        }
        let (head, tail) = self.data.split_at(n);
        self.data = tail;
        Ok(head)
    }

    fn skip(&mut self, n: usize, what: &'static str) -> Result<(), SniError> {
        self.take(n, what).map(|_| ())
    }

    fn u8(&mut self, what: &'static str) -> Result<u8, SniError> {
        Ok(self.take(1, what)?[0])
    }

    fn u16(&mut self, what: &'static str) -> Result<u16, SniError> {
        let b = self.take(2, what)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u24(&mut self, what: &'static str) -> Result<usize, SniError> {
        let b = self.take(3, what)?;
        Ok(((b[0] as usize) << 16) | ((b[1] as usize) << 8) | (b[2] as usize))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// Build a TLS 1.2-style ClientHello record with optional SNI.
    fn client_hello(extensions: &[(u16, Vec<u8>)]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&[0x03, 0x03]); // client version
        body.extend_from_slice(&[0u8; 32]); // random
        body.push(0); // session id
        body.extend_from_slice(&[0x00, 0x02, 0x00, 0x2f]); // one cipher suite
        body.extend_from_slice(&[0x01, 0x00]); // null compression

        let mut ext_block = Vec::new();
        for (ty, payload) in extensions {
            ext_block.extend_from_slice(&ty.to_be_bytes());
            ext_block.extend_from_slice(&(payload.len() as u16).to_be_bytes());
            ext_block.extend_from_slice(payload);
        }
        body.extend_from_slice(&(ext_block.len() as u16).to_be_bytes());
        body.extend_from_slice(&ext_block);

        wrap_handshake(HANDSHAKE_TYPE_CLIENT_HELLO, &body)
    }

    fn wrap_handshake(msg_type: u8, body: &[u8]) -> Vec<u8> {
        let mut handshake = vec![msg_type];
        handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
        handshake.extend_from_slice(body);

        let mut record = vec![RECORD_TYPE_HANDSHAKE, 0x03, 0x01];
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);
        record
    }

    fn sni_payload(entries: &[(u8, &[u8])]) -> Vec<u8> {
        let mut list = Vec::new();
        for (ty, name) in entries {
            list.push(*ty);
            list.extend_from_slice(&(name.len() as u16).to_be_bytes());
            list.extend_from_slice(name);
        }
        let mut payload = (list.len() as u16).to_be_bytes().to_vec();
        payload.extend_from_slice(&list);
        payload
    }

    fn hello_for(host: &str) -> Vec<u8> {
        client_hello(&[
            (0x000a, vec![0x00, 0x02, 0x00, 0x1d]),
            (EXTENSION_SERVER_NAME, sni_payload(&[(0, host.as_bytes())])),
        ])
    }

    #[test]
    fn test_parse_sni_found() {
        let buf = hello_for("b.example.com");
        assert_eq!(
            parse_client_hello(&buf),
            SniResult::Found("b.example.com".to_string())
        );
        assert_eq!(identify(&buf).as_deref(), Some("b.example.com"));
    }

    #[test]
    fn test_sni_case_preserved() {
        let buf = hello_for("WWW.Example.COM.");
        assert_eq!(identify(&buf).as_deref(), Some("WWW.Example.COM."));
    }

    #[test]
    fn test_first_host_name_entry_wins() {
        let payload = sni_payload(&[(7, b"ignored"), (0, b"first.test"), (0, b"second.test")]);
        let buf = client_hello(&[(EXTENSION_SERVER_NAME, payload)]);
        assert_eq!(
            parse_client_hello(&buf),
            SniResult::Found("first.test".to_string())
        );
    }

    #[test]
    fn test_no_sni_extension() {
        let buf = client_hello(&[(0x000a, vec![0x00, 0x02, 0x00, 0x1d])]);
        assert_eq!(
            parse_client_hello(&buf),
            SniResult::Failed(SniError::NoServerName)
        );
        assert_eq!(sniff(&buf), Sniffed::Unknown);
    }

    #[test]
    fn test_no_extensions_block() {
        let mut body = vec![0x03, 0x03];
        body.extend_from_slice(&[0u8; 32]);
        body.extend_from_slice(&[0x00, 0x00, 0x02, 0x00, 0x2f, 0x01, 0x00]);
        let buf = wrap_handshake(HANDSHAKE_TYPE_CLIENT_HELLO, &body);
        assert_eq!(
            parse_client_hello(&buf),
            SniResult::Failed(SniError::NoServerName)
        );
    }

    #[test]
    fn test_wrong_major_version_fails_without_fallback() {
        let mut buf = hello_for("example.com");
        buf[1] = 2;
        buf.extend_from_slice(b"\r\nHost: example.com\r\n");
        assert_eq!(
            parse_client_hello(&buf),
            SniResult::Failed(SniError::UnsupportedVersion(2))
        );
        assert_eq!(identify(&buf), None);
    }

    #[test]
    fn test_not_client_hello() {
        let buf = wrap_handshake(2, &[0u8; 40]);
        assert_eq!(
            parse_client_hello(&buf),
            SniResult::Failed(SniError::NotClientHello(2))
        );
    }

    #[test]
    fn test_truncated_record_fails() {
        let buf = hello_for("example.com");
        for cut in RECORD_HEADER_LEN..buf.len() {
            match parse_client_hello(&buf[..cut]) {
                SniResult::Failed(SniError::Truncated(_)) => {}
                other => panic!("cut at {}: expected Truncated, got {:?}", cut, other),
            }
        }
    }

    #[test]
    fn test_extension_length_overrun() {
        let mut buf = hello_for("example.com");
        // Inflate the declared SNI extension length past the block.
        let pos = buf.len() - (2 + 1 + 2 + "example.com".len()) - 2;
        buf[pos] = 0xff;
        assert!(matches!(
            parse_client_hello(&buf),
            SniResult::Failed(SniError::Truncated(_))
        ));
    }

    #[test]
    fn test_invalid_utf8_hostname() {
        let payload = sni_payload(&[(0, &[0xff, 0xfe, 0x41])]);
        let buf = client_hello(&[(EXTENSION_SERVER_NAME, payload)]);
        assert_eq!(
            parse_client_hello(&buf),
            SniResult::Failed(SniError::InvalidHostname)
        );
    }

    #[test]
    fn test_short_handshake_record_treated_as_plaintext() {
        assert_eq!(parse_client_hello(&[0x16, 0x03, 0x01]), SniResult::NotTls);
        assert_eq!(sniff(&[0x16, 0x03]), Sniffed::Unknown);
    }

    #[test]
    fn test_empty_input() {
        assert_eq!(parse_client_hello(&[]), SniResult::NotTls);
        assert_eq!(identify(&[]), None);
    }

    #[test]
    fn test_http_host() {
        let req = b"GET / HTTP/1.1\r\nHost: test.local\r\nAccept: */*\r\n\r\n";
        assert_eq!(sniff(req), Sniffed::HttpHost("test.local".to_string()));
    }

    #[test]
    fn test_http_host_keeps_port_suffix() {
        let req = b"GET / HTTP/1.1\r\nHost: test.local:8080\r\n\r\n";
        assert_eq!(http_host(req).as_deref(), Some("test.local:8080"));
    }

    #[test]
    fn test_http_host_is_case_sensitive() {
        let req = b"GET / HTTP/1.1\r\nhost: test.local\r\n\r\n";
        assert_eq!(http_host(req), None);
        let req = b"GET / HTTP/1.1\r\nHost:test.local\r\n\r\n";
        assert_eq!(http_host(req), None);
    }

    #[test]
    fn test_http_host_requires_line_terminator() {
        assert_eq!(http_host(b"GET / HTTP/1.1\r\nHost: cut.off"), None);
        assert_eq!(http_host(b"GET / HTTP/1.1\r\nHost: lf.only\n"), None);
    }

    #[test]
    fn test_http_host_skips_unterminated_candidate() {
        let req = b"GET / HTTP/1.1\r\nHost: bad\n\r\nHost: good\r\n\r\n";
        assert_eq!(http_host(req).as_deref(), Some("good"));

        let req = b"GET / HTTP/1.1\r\nHost: a\nX: y\nHost: b\n\r\nHost: c.test\r\n";
        assert_eq!(sniff(req), Sniffed::HttpHost("c.test".to_string()));
    }

    #[test]
    fn test_http_empty_host_is_unknown() {
        let req = b"GET / HTTP/1.1\r\nHost: \r\n\r\n";
        assert_eq!(sniff(req), Sniffed::Unknown);
    }

    #[test]
    fn test_http_host_first_line_not_matched() {
        // The header must follow a CRLF, so a request starting with it is ignored.
        assert_eq!(http_host(b"Host: a.test\r\n"), None);
    }

    proptest! {
        #[test]
        fn sniff_is_total(buf in proptest::collection::vec(any::<u8>(), 0..512)) {
            let _ = sniff(&buf);
        }

        #[test]
        fn sniff_is_total_on_handshake_prefix(
            tail in proptest::collection::vec(any::<u8>(), 0..512)
        ) {
            let mut buf = vec![RECORD_TYPE_HANDSHAKE, 0x03, 0x01];
            buf.extend_from_slice(&tail);
            prop_assert_eq!(
                matches!(parse_client_hello(&buf), SniResult::NotTls),
                buf.len() < RECORD_HEADER_LEN
            );
        }

        #[test]
        fn sni_truncation_never_yields_partial_name(cut in 0usize..200) {
            let buf = hello_for("complete.example.test");
            let cut = cut.min(buf.len());
            if let SniResult::Found(name) = parse_client_hello(&buf[..cut]) {
                prop_assert_eq!(name, "complete.example.test");
            }
        }
    }
}
