//! Tokenizer for the `${{ ... }}` expression language.

use super::ExprError;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Token {
    Ident(String),
    Str(String),
    Number(f64),
    Dot,
    Comma,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Not,
    EqEq,
    NotEq,
    AndAnd,
    OrOr,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Token {
    pub(crate) fn describe(&self) -> String {
        match self {
            Token::Ident(s) => format!("identifier '{s}'"),
            Token::Str(s) => format!("string '{s}'"),
            Token::Number(n) => format!("number {n}"),
            Token::Dot => "'.'".to_string(),
            Token::Comma => "','".to_string(),
            Token::LParen => "'('".to_string(),
            Token::RParen => "')'".to_string(),
            Token::LBracket => "'['".to_string(),
            Token::RBracket => "']'".to_string(),
            Token::Not => "'!'".to_string(),
            Token::EqEq => "'=='".to_string(),
            Token::NotEq => "'!='".to_string(),
            Token::AndAnd => "'&&'".to_string(),
            Token::OrOr => "'||'".to_string(),
            Token::Lt => "'<'".to_string(),
            Token::Le => "'<='".to_string(),
            Token::Gt => "'>'".to_string(),
            Token::Ge => "'>='".to_string(),
        }
    }
}

/// A token with its byte offset in the expression source.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Spanned {
    pub token: Token,
    pub pos: usize,
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_continue(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

pub(crate) fn tokenize(src: &str) -> Result<Vec<Spanned>, ExprError> {
    let chars: Vec<(usize, char)> = src.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let (pos, c) = chars[i];
        let next = chars.get(i + 1).map(|(_, c)| *c);

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        let two = |t: Token| Spanned { token: t, pos };
        match (c, next) {
            ('=', Some('=')) => {
                tokens.push(two(Token::EqEq));
                i += 2;
                continue;
            }
            ('!', Some('=')) => {
                tokens.push(two(Token::NotEq));
                i += 2;
                continue;
            }
            ('&', Some('&')) => {
                tokens.push(two(Token::AndAnd));
                i += 2;
                continue;
            }
            ('|', Some('|')) => {
                tokens.push(two(Token::OrOr));
                i += 2;
                continue;
            }
            ('<', Some('=')) => {
                tokens.push(two(Token::Le));
                i += 2;
                continue;
            }
            ('>', Some('=')) => {
                tokens.push(two(Token::Ge));
                i += 2;
                continue;
            }
            _ => {}
        }

        let single = match c {
            '.' if !next.is_some_and(|n| n.is_ascii_digit()) => Some(Token::Dot),
            ',' => Some(Token::Comma),
            '(' => Some(Token::LParen),
            ')' => Some(Token::RParen),
            '[' => Some(Token::LBracket),
            ']' => Some(Token::RBracket),
            '!' => Some(Token::Not),
            '<' => Some(Token::Lt),
            '>' => Some(Token::Gt),
            _ => None,
        };
        if let Some(token) = single {
            tokens.push(Spanned { token, pos });
            i += 1;
            continue;
        }

        if c == '\'' {
            // Single-quoted string; '' is an escaped quote.
            let mut value = String::new();
            let mut j = i + 1;
            loop {
                match chars.get(j) {
                    None => return Err(ExprError::UnterminatedString { pos }),
                    Some((_, '\'')) => {
                        if chars.get(j + 1).map(|(_, c)| *c) == Some('\'') {
                            value.push('\'');
                            j += 2;
                        } else {
                            j += 1;
                            break;
                        }
                    }
                    Some((_, ch)) => {
                        value.push(*ch);
                        j += 1;
                    }
                }
            }
            tokens.push(Spanned {
                token: Token::Str(value),
                pos,
            });
            i = j;
            continue;
        }

        if c.is_ascii_digit() || (c == '-' && next.is_some_and(|n| n.is_ascii_digit())) || c == '.'
        {
            let mut j = i + 1;
            while let Some((_, ch)) = chars.get(j) {
                if ch.is_ascii_alphanumeric() || *ch == '.' {
                    j += 1;
                } else {
                    break;
                }
            }
            let end = chars.get(j).map(|(p, _)| *p).unwrap_or(src.len());
            let text = &src[pos..end];
            let value = parse_number(text).ok_or(ExprError::InvalidNumber {
                pos,
                text: text.to_string(),
            })?;
            tokens.push(Spanned {
                token: Token::Number(value),
                pos,
            });
            i = j;
            continue;
        }

        if is_ident_start(c) {
            let mut j = i + 1;
            while let Some((_, ch)) = chars.get(j) {
                if is_ident_continue(*ch) {
                    j += 1;
                } else {
                    break;
                }
            }
            let end = chars.get(j).map(|(p, _)| *p).unwrap_or(src.len());
            tokens.push(Spanned {
                token: Token::Ident(src[pos..end].to_string()),
                pos,
            });
            i = j;
            continue;
        }

        return Err(ExprError::UnexpectedChar { pos, ch: c });
    }

    Ok(tokens)
}

fn parse_number(text: &str) -> Option<f64> {
    if let Some(hex) = text.strip_prefix("0x") {
        return i64::from_str_radix(hex, 16).ok().map(|v| v as f64);
    }
    text.parse::<f64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<Token> {
        tokenize(src).unwrap().into_iter().map(|s| s.token).collect()
    }

    #[test]
    fn test_property_path_with_dashes() {
        assert_eq!(
            kinds("matrix.tox-env"),
            vec![
                Token::Ident("matrix".to_string()),
                Token::Dot,
                Token::Ident("tox-env".to_string()),
            ]
        );
    }

    #[test]
    fn test_or_operator_and_string_escape() {
        assert_eq!(
            kinds("a || 'it''s'"),
            vec![
                Token::Ident("a".to_string()),
                Token::OrOr,
                Token::Str("it's".to_string()),
            ]
        );
    }

    #[test]
    fn test_numbers() {
        assert_eq!(kinds("42"), vec![Token::Number(42.0)]);
        assert_eq!(kinds("-1.5"), vec![Token::Number(-1.5)]);
        assert_eq!(kinds("0xff"), vec![Token::Number(255.0)]);
    }

    #[test]
    fn test_unterminated_string_is_error() {
        assert!(matches!(
            tokenize("'open"),
            Err(ExprError::UnterminatedString { pos: 0 })
        ));
    }

    #[test]
    fn test_unexpected_char_is_error() {
        assert!(matches!(
            tokenize("a } b"),
            Err(ExprError::UnexpectedChar { ch: '}', .. })
        ));
    }
}
