use super::FormulaSyntaxError;

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Number(f64),
    Text(String),
    Ident(String),
    LParen,
    RParen,
    Comma,
    Plus,
    Minus,
    Star,
    Slash,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    /// Character offset into the source.
    pub position: usize,
}

pub fn tokenize(src: &str) -> Result<Vec<Token>, FormulaSyntaxError> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let start = i;

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        let kind = match c {
            '(' => single(&mut i, TokenKind::LParen),
            ')' => single(&mut i, TokenKind::RParen),
            ',' => single(&mut i, TokenKind::Comma),
            '+' => single(&mut i, TokenKind::Plus),
            '-' => single(&mut i, TokenKind::Minus),
            '*' => single(&mut i, TokenKind::Star),
            '/' => single(&mut i, TokenKind::Slash),
            '=' => single(&mut i, TokenKind::Eq),
            '<' => match chars.get(i + 1) {
                Some('>') => double(&mut i, TokenKind::Ne),
                Some('=') => double(&mut i, TokenKind::Le),
                _ => single(&mut i, TokenKind::Lt),
            },
            '>' => match chars.get(i + 1) {
                Some('=') => double(&mut i, TokenKind::Ge),
                _ => single(&mut i, TokenKind::Gt),
            },
            '"' | '“' | '”' => TokenKind::Text(read_string(&chars, &mut i)?),
            c if c.is_ascii_digit() || c == '.' => TokenKind::Number(read_number(&chars, &mut i)?),
            c if c.is_alphabetic() || c == '_' => {
                while i < chars.len() && (chars[i].is_alphanumeric() || matches!(chars[i], '_' | '.')) {
                    i += 1;
                }
                TokenKind::Ident(chars[start..i].iter().collect())
            }
            other => {
                return Err(FormulaSyntaxError::new(
                    format!("unexpected character '{}'", other),
                    start,
                ));
            }
        };

        tokens.push(Token { kind, position: start });
    }

    tokens.push(Token {
        kind: TokenKind::Eof,
        position: chars.len(),
    });
    Ok(tokens)
}

fn single(i: &mut usize, kind: TokenKind) -> TokenKind {
    *i += 1;
    kind
}

fn double(i: &mut usize, kind: TokenKind) -> TokenKind {
    *i += 2;
    kind
}

/// Double-quoted string; `""` inside the quotes is a literal quote.
fn read_string(chars: &[char], i: &mut usize) -> Result<String, FormulaSyntaxError> {
    let start = *i;
    let is_quote = |c: char| matches!(c, '"' | '“' | '”');
    *i += 1;
    let mut out = String::new();
    while *i < chars.len() {
        let c = chars[*i];
        if is_quote(c) {
            if chars.get(*i + 1).copied().is_some_and(is_quote) {
                out.push('"');
                *i += 2;
                continue;
            }
            *i += 1;
            return Ok(out);
        }
        out.push(c);
        *i += 1;
    }
    Err(FormulaSyntaxError::new("unterminated string literal", start))
}

fn read_number(chars: &[char], i: &mut usize) -> Result<f64, FormulaSyntaxError> {
    let start = *i;
    while *i < chars.len() && (chars[*i].is_ascii_digit() || chars[*i] == '.') {
        *i += 1;
    }
    if *i < chars.len() && matches!(chars[*i], 'e' | 'E') {
        let mut j = *i + 1;
        if j < chars.len() && matches!(chars[j], '+' | '-') {
            j += 1;
        }
        if j < chars.len() && chars[j].is_ascii_digit() {
            while j < chars.len() && chars[j].is_ascii_digit() {
                j += 1;
            }
            *i = j;
        }
    }
    let text: String = chars[start..*i].iter().collect();
    text.parse()
        .map_err(|_| FormulaSyntaxError::new(format!("invalid number '{}'", text), start))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        tokenize(src).unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_operators() {
        assert_eq!(
            kinds("<> <= >= < > ="),
            vec![
                TokenKind::Ne,
                TokenKind::Le,
                TokenKind::Ge,
                TokenKind::Lt,
                TokenKind::Gt,
                TokenKind::Eq,
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_literals() {
        assert_eq!(
            kinds(r#"Q12 1.5e2 "say ""hi""""#),
            vec![
                TokenKind::Ident("Q12".into()),
                TokenKind::Number(150.0),
                TokenKind::Text("say \"hi\"".into()),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_positions() {
        let toks = tokenize("IF( Q12").unwrap();
        assert_eq!(toks[0].position, 0);
        assert_eq!(toks[1].position, 2);
        assert_eq!(toks[2].position, 4);
        assert_eq!(toks[3].position, 7);
    }

    #[test]
    fn test_errors() {
        let err = tokenize("Q12 > 5 %").unwrap_err();
        assert_eq!(err.position, 8);
        assert!(tokenize("\"open").is_err());
        assert!(tokenize("1.2.3").is_err());
    }
}
