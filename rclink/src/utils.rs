/// Decode the bytes before the first NUL, replacing invalid UTF-8.
pub fn nul_terminated_to_string(raw: &[u8]) -> String {
    let count = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..count]).into_owned()
}

/// Strip one trailing line break (`\n` or `\r\n`) from a line read from stdin.
pub fn trim_line_end(line: &str) -> &str {
    let line = line.strip_suffix('\n').unwrap_or(line);
    line.strip_suffix('\r').unwrap_or(line)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stops_at_nul() {
        assert_eq!(nul_terminated_to_string(b"abc\0def"), "abc");
        assert_eq!(nul_terminated_to_string(b"abc"), "abc");
        assert_eq!(nul_terminated_to_string(b"\0"), "");
    }

    #[test]
    fn line_end() {
        assert_eq!(trim_line_end("hi\n"), "hi");
        assert_eq!(trim_line_end("hi\r\n"), "hi");
        assert_eq!(trim_line_end("hi"), "hi");
    }
}
