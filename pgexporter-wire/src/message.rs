//! Frame-level encoding and decoding for the PostgreSQL v3 protocol.
//!
//! Frontend messages are written into a [`BytesMut`] and flushed by the
//! connection; backend messages arrive as a one-byte tag plus a length-prefixed
//! payload and are decoded here into [`BackendMessage`] values. Only the
//! subset needed for read-only introspection is implemented.

use std::collections::HashMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::WireError;

/// Protocol version sent in the StartupMessage: 3.0.
pub const PROTOCOL_VERSION: i32 = 196_608;

/// Magic "version" carried by the SSLRequest sentinel message.
pub const SSL_REQUEST_CODE: i32 = 80_877_103;

/// Authentication request variants the server can ask for ('R' messages).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthRequest {
    /// Authentication completed.
    Ok,
    /// Send the password in the clear.
    CleartextPassword,
    /// Send `md5(md5(password + user) + salt)`.
    Md5Password([u8; 4]),
    /// SASL negotiation; carries the server's mechanism list.
    Sasl(Vec<String>),
    /// SASL continuation data (server-first-message).
    SaslContinue(Bytes),
    /// SASL final data (server-final-message).
    SaslFinal(Bytes),
    /// A scheme we do not implement.
    Unsupported(i32),
}

/// One column of a RowDescription.
#[derive(Debug, Clone)]
pub struct ColumnDescription {
    pub name: String,
    pub type_oid: i32,
}

/// Decoded backend messages.
#[derive(Debug)]
pub enum BackendMessage {
    Authentication(AuthRequest),
    ParameterStatus { name: String, value: String },
    BackendKeyData { pid: i32, secret: i32 },
    ReadyForQuery(u8),
    RowDescription(Vec<ColumnDescription>),
    DataRow(Vec<Option<Bytes>>),
    CommandComplete(String),
    EmptyQueryResponse,
    ErrorResponse(ErrorFields),
    NoticeResponse(ErrorFields),
}

/// Field map of an ErrorResponse / NoticeResponse.
#[derive(Debug, Default, Clone)]
pub struct ErrorFields {
    fields: HashMap<u8, String>,
}

impl ErrorFields {
    pub fn severity(&self) -> &str {
        self.fields.get(&b'S').map(String::as_str).unwrap_or("ERROR")
    }

    pub fn sqlstate(&self) -> &str {
        self.fields.get(&b'C').map(String::as_str).unwrap_or("XX000")
    }

    pub fn message(&self) -> &str {
        self.fields.get(&b'M').map(String::as_str).unwrap_or("unknown error")
    }
}

pub fn write_ssl_request(buf: &mut BytesMut) {
    buf.put_i32(8);
    buf.put_i32(SSL_REQUEST_CODE);
}

/// StartupMessage with `user`, `database` and `application_name` parameters.
pub fn write_startup(buf: &mut BytesMut, user: &str, database: &str, application_name: &str) {
    let mut body = BytesMut::new();
    body.put_i32(PROTOCOL_VERSION);
    for (k, v) in [
        ("user", user),
        ("database", database),
        ("application_name", application_name),
    ] {
        if !v.is_empty() {
            put_cstr(&mut body, k);
            put_cstr(&mut body, v);
        }
    }
    body.put_u8(0);

    buf.put_i32(body.len() as i32 + 4);
    buf.put_slice(&body);
}

pub fn write_password(buf: &mut BytesMut, password: &str) {
    buf.put_u8(b'p');
    buf.put_i32(password.len() as i32 + 1 + 4);
    put_cstr(buf, password);
}

pub fn write_sasl_initial(buf: &mut BytesMut, mechanism: &str, initial: &[u8]) {
    buf.put_u8(b'p');
    buf.put_i32((mechanism.len() + 1 + 4 + initial.len()) as i32 + 4);
    put_cstr(buf, mechanism);
    buf.put_i32(initial.len() as i32);
    buf.put_slice(initial);
}

pub fn write_sasl_response(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u8(b'p');
    buf.put_i32(data.len() as i32 + 4);
    buf.put_slice(data);
}

pub fn write_query(buf: &mut BytesMut, sql: &str) {
    buf.put_u8(b'Q');
    buf.put_i32(sql.len() as i32 + 1 + 4);
    put_cstr(buf, sql);
}

pub fn write_terminate(buf: &mut BytesMut) {
    buf.put_u8(b'X');
    buf.put_i32(4);
}

fn put_cstr(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

/// Decodes one backend message from its tag and payload.
pub fn decode(tag: u8, mut body: Bytes) -> Result<BackendMessage, WireError> {
    match tag {
        b'R' => decode_auth(&mut body),
        b'S' => {
            let name = get_cstr(&mut body)?;
            let value = get_cstr(&mut body)?;
            Ok(BackendMessage::ParameterStatus { name, value })
        }
        b'K' => {
            ensure_len(&body, 8)?;
            Ok(BackendMessage::BackendKeyData { pid: body.get_i32(), secret: body.get_i32() })
        }
        b'Z' => {
            ensure_len(&body, 1)?;
            Ok(BackendMessage::ReadyForQuery(body.get_u8()))
        }
        b'T' => decode_row_description(&mut body),
        b'D' => decode_data_row(&mut body),
        b'C' => Ok(BackendMessage::CommandComplete(get_cstr(&mut body)?)),
        b'I' => Ok(BackendMessage::EmptyQueryResponse),
        b'E' => Ok(BackendMessage::ErrorResponse(decode_fields(&mut body)?)),
        b'N' => Ok(BackendMessage::NoticeResponse(decode_fields(&mut body)?)),
        other => Err(WireError::protocol(format!("unexpected message kind {:?}", other as char))),
    }
}

fn decode_auth(body: &mut Bytes) -> Result<BackendMessage, WireError> {
    ensure_len(body, 4)?;
    let code = body.get_i32();
    let req = match code {
        0 => AuthRequest::Ok,
        3 => AuthRequest::CleartextPassword,
        5 => {
            ensure_len(body, 4)?;
            let mut salt = [0u8; 4];
            salt.copy_from_slice(&body.split_to(4));
            AuthRequest::Md5Password(salt)
        }
        10 => {
            let mut mechanisms = Vec::new();
            while body.has_remaining() && body[0] != 0 {
                mechanisms.push(get_cstr(body)?);
            }
            AuthRequest::Sasl(mechanisms)
        }
        11 => AuthRequest::SaslContinue(body.split_to(body.len())),
        12 => AuthRequest::SaslFinal(body.split_to(body.len())),
        other => AuthRequest::Unsupported(other),
    };
    Ok(BackendMessage::Authentication(req))
}

fn decode_row_description(body: &mut Bytes) -> Result<BackendMessage, WireError> {
    ensure_len(body, 2)?;
    let count = body.get_i16();
    let mut columns = Vec::with_capacity(count.max(0) as usize);
    for _ in 0..count {
        let name = get_cstr(body)?;
        // table oid, attnum, type oid, typlen, atttypmod, format code
        ensure_len(body, 18)?;
        body.get_i32();
        body.get_i16();
        let type_oid = body.get_i32();
        body.get_i16();
        body.get_i32();
        body.get_i16();
        columns.push(ColumnDescription { name, type_oid });
    }
    Ok(BackendMessage::RowDescription(columns))
}

fn decode_data_row(body: &mut Bytes) -> Result<BackendMessage, WireError> {
    ensure_len(body, 2)?;
    let count = body.get_i16();
    let mut values = Vec::with_capacity(count.max(0) as usize);
    for _ in 0..count {
        ensure_len(body, 4)?;
        let len = body.get_i32();
        if len < 0 {
            values.push(None);
        } else {
            ensure_len(body, len as usize)?;
            values.push(Some(body.split_to(len as usize)));
        }
    }
    Ok(BackendMessage::DataRow(values))
}

fn decode_fields(body: &mut Bytes) -> Result<ErrorFields, WireError> {
    let mut fields = HashMap::new();
    while body.has_remaining() {
        let kind = body.get_u8();
        if kind == 0 {
            break;
        }
        fields.insert(kind, get_cstr(body)?);
    }
    Ok(ErrorFields { fields })
}

fn get_cstr(body: &mut Bytes) -> Result<String, WireError> {
    let end = body
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| WireError::protocol("unterminated string in message"))?;
    let raw = body.split_to(end);
    body.advance(1);
    String::from_utf8(raw.to_vec()).map_err(|_| WireError::protocol("non-utf8 string in message"))
}

fn ensure_len(body: &Bytes, len: usize) -> Result<(), WireError> {
    if body.remaining() < len {
        return Err(WireError::protocol("truncated message"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn startup_message_layout() {
        let mut buf = BytesMut::new();
        write_startup(&mut buf, "prom", "postgres", "pgexporter");
        let mut b = buf.freeze();
        let len = b.get_i32();
        assert_eq!(len as usize, b.remaining() + 4);
        assert_eq!(b.get_i32(), PROTOCOL_VERSION);
        let rest = b.to_vec();
        assert!(rest.starts_with(b"user\0prom\0database\0postgres\0"));
        assert_eq!(*rest.last().unwrap(), 0);
    }

    #[test]
    fn ssl_request_sentinel() {
        let mut buf = BytesMut::new();
        write_ssl_request(&mut buf);
        assert_eq!(&buf[..], &[0, 0, 0, 8, 0x04, 0xd2, 0x16, 0x2f]);
    }

    #[test]
    fn decode_auth_variants() {
        let mut body = BytesMut::new();
        body.put_i32(0);
        match decode(b'R', body.freeze()).unwrap() {
            BackendMessage::Authentication(AuthRequest::Ok) => {}
            other => panic!("unexpected: {other:?}"),
        }

        let mut body = BytesMut::new();
        body.put_i32(5);
        body.put_slice(&[1, 2, 3, 4]);
        match decode(b'R', body.freeze()).unwrap() {
            BackendMessage::Authentication(AuthRequest::Md5Password(salt)) => {
                assert_eq!(salt, [1, 2, 3, 4]);
            }
            other => panic!("unexpected: {other:?}"),
        }

        let mut body = BytesMut::new();
        body.put_i32(10);
        body.put_slice(b"SCRAM-SHA-256\0\0");
        match decode(b'R', body.freeze()).unwrap() {
            BackendMessage::Authentication(AuthRequest::Sasl(mechs)) => {
                assert_eq!(mechs, vec!["SCRAM-SHA-256".to_string()]);
            }
            other => panic!("unexpected: {other:?}"),
        }

        let mut body = BytesMut::new();
        body.put_i32(99);
        match decode(b'R', body.freeze()).unwrap() {
            BackendMessage::Authentication(AuthRequest::Unsupported(99)) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn decode_row_description_and_data_row() {
        let mut body = BytesMut::new();
        body.put_i16(2);
        for name in ["datname", "size"] {
            body.put_slice(name.as_bytes());
            body.put_u8(0);
            body.put_i32(0);
            body.put_i16(0);
            body.put_i32(25);
            body.put_i16(-1);
            body.put_i32(-1);
            body.put_i16(0);
        }
        match decode(b'T', body.freeze()).unwrap() {
            BackendMessage::RowDescription(cols) => {
                assert_eq!(cols.len(), 2);
                assert_eq!(cols[0].name, "datname");
                assert_eq!(cols[1].name, "size");
            }
            other => panic!("unexpected: {other:?}"),
        }

        let mut body = BytesMut::new();
        body.put_i16(2);
        body.put_i32(8);
        body.put_slice(b"postgres");
        body.put_i32(-1);
        match decode(b'D', body.freeze()).unwrap() {
            BackendMessage::DataRow(values) => {
                assert_eq!(values.len(), 2);
                assert_eq!(values[0].as_deref(), Some(&b"postgres"[..]));
                assert!(values[1].is_none());
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn decode_error_fields() {
        let mut body = BytesMut::new();
        body.put_slice(b"SERROR\0C28P01\0Mpassword authentication failed\0\0");
        match decode(b'E', body.freeze()).unwrap() {
            BackendMessage::ErrorResponse(fields) => {
                assert_eq!(fields.severity(), "ERROR");
                assert_eq!(fields.sqlstate(), "28P01");
                assert_eq!(fields.message(), "password authentication failed");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn unknown_tag_is_protocol_error() {
        assert!(matches!(decode(b'q', Bytes::new()), Err(WireError::Protocol(_))));
    }
}
