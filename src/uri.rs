/// URI 辅助函数
///
/// 尽力而为的百分号解码，以及日志中隐藏凭据的 URL 格式化
use percent_encoding::percent_decode_str;
use url::Url;

/// 解码结果：成功解码或回退到原始输入
enum Decoded<'a> {
    Decoded(String),
    Original(&'a str),
}

impl Decoded<'_> {
    fn into_string(self) -> String {
        match self {
            Decoded::Decoded(s) => s,
            Decoded::Original(s) => s.to_string(),
        }
    }
}

fn try_decode(input: &str) -> Decoded<'_> {
    // percent_decode_str 会原样保留非法转义，这里需要显式拒绝
    let bytes = input.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let valid = bytes.len() > i + 2
                && bytes[i + 1].is_ascii_hexdigit()
                && bytes[i + 2].is_ascii_hexdigit();
            if !valid {
                return Decoded::Original(input);
            }
            i += 3;
        } else {
            i += 1;
        }
    }

    match percent_decode_str(input).decode_utf8() {
        Ok(decoded) => Decoded::Decoded(decoded.into_owned()),
        Err(_) => Decoded::Original(input),
    }
}

/// 解码百分号编码的 URI 组件，失败时返回原始输入
///
/// 非法转义（`%` 后不是两位十六进制）或解码后不是合法 UTF-8 时不报错。
pub fn decode_uri_component_safe(input: &str) -> String {
    try_decode(input).into_string()
}

/// 返回隐藏密码后的 URL 字符串，用于日志
pub fn redact_url(url: &Url) -> String {
    if url.password().is_none() {
        return url.to_string();
    }
    let mut redacted = url.clone();
    if redacted.set_password(Some("***")).is_err() {
        return format!("{}://<redacted>", url.scheme());
    }
    redacted.to_string()
}
