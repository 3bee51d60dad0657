/// Render wire bytes for log output.
///
/// Printable ASCII is kept as-is, CR/LF are shown as `\r`/`\n` and every
/// other byte is shown as `\xNN`, so a single log line always holds a
/// complete modem exchange.
pub fn escape_bytes(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    for &byte in bytes {
        match byte {
            b'\r' => out.push_str("\\r"),
            b'\n' => out.push_str("\\n"),
            0x20..=0x7e => out.push(byte as char),
            _ => out.push_str(&format!("\\x{byte:02x}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_bytes() {
        assert_eq!(escape_bytes(b"AT\r\n"), "AT\\r\\n");
        assert_eq!(escape_bytes(&[0x1a, b'>']), "\\x1a>");
    }
}
