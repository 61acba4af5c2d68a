use crate::error::ParseError;

#[derive(Debug, Clone, PartialEq)]
pub(super) enum Token {
    Ident(String),
    Int(i64),
    Float(f64),
    Str(String),
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Semi,
    Assign,
    PathSep,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    EqEq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    AndAnd,
    OrOr,
    Bang,
}

#[derive(Debug, Clone, PartialEq)]
pub(super) struct Spanned {
    pub token: Token,
    pub offset: usize,
}

pub(super) fn tokenize(text: &str) -> Result<Vec<Spanned>, ParseError> {
    let bytes = text.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        let start = i;

        if c.is_ascii_whitespace() {
            i += 1;
            continue;
        }

        // line comment
        if c == b'#' {
            while i < bytes.len() && bytes[i] != b'\n' {
                i += 1;
            }
            continue;
        }

        if c.is_ascii_alphabetic() || c == b'_' || c == b'.' && next_is_alpha(bytes, i) {
            while i < bytes.len()
                && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_' || bytes[i] == b'.')
            {
                i += 1;
            }
            tokens.push(Spanned {
                token: Token::Ident(text[start..i].to_string()),
                offset: start,
            });
            continue;
        }

        if c.is_ascii_digit() {
            let (token, end) = number(text, start)?;
            tokens.push(Spanned {
                token,
                offset: start,
            });
            i = end;
            continue;
        }

        if c == b'"' {
            let (string, end) = string(text, start)?;
            tokens.push(Spanned {
                token: Token::Str(string),
                offset: start,
            });
            i = end;
            continue;
        }

        let two = bytes.get(i + 1).copied();
        let (token, width) = match (c, two) {
            (b':', Some(b':')) => (Token::PathSep, 2),
            (b'=', Some(b'=')) => (Token::EqEq, 2),
            (b'!', Some(b'=')) => (Token::Ne, 2),
            (b'<', Some(b'=')) => (Token::Le, 2),
            (b'>', Some(b'=')) => (Token::Ge, 2),
            (b'&', Some(b'&')) => (Token::AndAnd, 2),
            (b'|', Some(b'|')) => (Token::OrOr, 2),
            (b'(', _) => (Token::LParen, 1),
            (b')', _) => (Token::RParen, 1),
            (b'[', _) => (Token::LBracket, 1),
            (b']', _) => (Token::RBracket, 1),
            (b'{', _) => (Token::LBrace, 1),
            (b'}', _) => (Token::RBrace, 1),
            (b',', _) => (Token::Comma, 1),
            (b';', _) => (Token::Semi, 1),
            (b'=', _) => (Token::Assign, 1),
            (b'+', _) => (Token::Plus, 1),
            (b'-', _) => (Token::Minus, 1),
            (b'*', _) => (Token::Star, 1),
            (b'/', _) => (Token::Slash, 1),
            (b'%', _) => (Token::Percent, 1),
            (b'<', _) => (Token::Lt, 1),
            (b'>', _) => (Token::Gt, 1),
            (b'!', _) => (Token::Bang, 1),
            _ => {
                let ch = text[start..].chars().next().unwrap_or('?');
                return Err(ParseError::new(start, format!("unexpected character '{ch}'")));
            }
        };

        tokens.push(Spanned {
            token,
            offset: start,
        });
        i += width;
    }

    Ok(tokens)
}

fn next_is_alpha(bytes: &[u8], i: usize) -> bool {
    bytes
        .get(i + 1)
        .is_some_and(|b| b.is_ascii_alphabetic() || *b == b'_')
}

fn number(text: &str, start: usize) -> Result<(Token, usize), ParseError> {
    let bytes = text.as_bytes();
    let mut i = start;
    let mut float = false;

    while i < bytes.len() && bytes[i].is_ascii_digit() {
        i += 1;
    }

    if i + 1 < bytes.len() && bytes[i] == b'.' && bytes[i + 1].is_ascii_digit() {
        float = true;
        i += 1;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
    }

    if i < bytes.len() && (bytes[i] == b'e' || bytes[i] == b'E') {
        let mut j = i + 1;
        if j < bytes.len() && (bytes[j] == b'+' || bytes[j] == b'-') {
            j += 1;
        }
        if j < bytes.len() && bytes[j].is_ascii_digit() {
            float = true;
            i = j;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
        }
    }

    let literal = &text[start..i];
    let token = if float {
        literal
            .parse()
            .map(Token::Float)
            .map_err(|_| ParseError::new(start, format!("invalid number '{literal}'")))?
    } else {
        literal
            .parse()
            .map(Token::Int)
            .map_err(|_| ParseError::new(start, format!("integer '{literal}' out of range")))?
    };

    Ok((token, i))
}

fn string(text: &str, start: usize) -> Result<(String, usize), ParseError> {
    let mut out = String::new();
    let mut chars = text[start + 1..].char_indices();

    while let Some((i, c)) = chars.next() {
        match c {
            '"' => return Ok((out, start + 1 + i + 1)),
            '\\' => match chars.next() {
                Some((_, 'n')) => out.push('\n'),
                Some((_, 't')) => out.push('\t'),
                Some((_, 'r')) => out.push('\r'),
                Some((_, '0')) => out.push('\0'),
                Some((_, '\\')) => out.push('\\'),
                Some((_, '"')) => out.push('"'),
                Some((j, other)) => {
                    return Err(ParseError::new(
                        start + 1 + j,
                        format!("unknown escape '\\{other}'"),
                    ));
                }
                None => break,
            },
            other => out.push(other),
        }
    }

    Err(ParseError::new(start, "unterminated string"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(text: &str) -> Vec<Token> {
        tokenize(text)
            .unwrap()
            .into_iter()
            .map(|s| s.token)
            .collect()
    }

    #[test]
    fn test_tokens() {
        assert_eq!(
            kinds(r#"stats::lm(y, "a\"b") >= 1.5e2"#),
            vec![
                Token::Ident("stats".into()),
                Token::PathSep,
                Token::Ident("lm".into()),
                Token::LParen,
                Token::Ident("y".into()),
                Token::Comma,
                Token::Str("a\"b".into()),
                Token::RParen,
                Token::Ge,
                Token::Float(150.0),
            ]
        );
    }

    #[test]
    fn test_comment_skipped() {
        assert_eq!(kinds("a # trailing\n b"), vec![
            Token::Ident("a".into()),
            Token::Ident("b".into()),
        ]);
    }

    #[test]
    fn test_unterminated() {
        let err = tokenize(r#"f("abc"#).unwrap_err();
        assert_eq!(err.offset, 2);
    }

    #[test]
    fn test_unexpected_character() {
        assert!(tokenize("a @ b").is_err());
    }
}
