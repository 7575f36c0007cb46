//! Lexer for the Poke language.
//!
//! Grounded in `seq-compiler`'s `parser.rs::tokenize` shape (a flat
//! `Vec<Token>` produced ahead of time rather than a streaming lexer) —
//! its `Token`/`PartialEq<&str>` convenience impls are reused almost
//! verbatim, since poke's token alphabet (identifiers, integers, strings,
//! operators) is a superset of that one, not a different shape.
//!
//! The "alien token" hook (`$foo`-style identifiers resolved by a host
//! callback when "lexical cuckolding" is enabled) is represented here as
//! a distinct `Alien(String)` token the parser can route to a host hook;
//! this crate's own parser treats an alien token as an ordinary
//! identifier when no hook is installed.

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Ident(String),
    Int(i64),
    /// `0x...`/`0b...` literals remember their base only for error messages;
    /// the parsed value is already in `Int`.
    Str(String),
    /// `$name` — an alien token.
    Alien(String),

    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Amp,
    Pipe,
    Caret,
    Tilde,
    Bang,
    Shl,
    Shr,
    Lt,
    Gt,
    Le,
    Ge,
    EqEq,
    Ne,
    AndAnd,
    OrOr,
    Eq,
    Question,
    Colon,
    ColonColon,
    Semi,
    Comma,
    Dot,
    At,
    Hash,
    Arrow,
    PlusPlus,
    MinusMinus,

    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,

    // keywords
    KwVar,
    KwType,
    KwFun,
    KwStruct,
    KwUnion,
    KwEnum,
    KwIf,
    KwElse,
    KwWhile,
    KwFor,
    KwIn,
    KwWhere,
    KwBreak,
    KwContinue,
    KwReturn,
    KwTry,
    KwCatch,
    KwUntil,
    KwRaise,
    KwPrint,
    KwPrintln,
    KwIsa,
    KwPinned,
    KwMethod,
    KwInt,
    KwUint,
    KwLong,
    KwUlong,
    KwString,
    KwVoid,
    KwAny,
    KwOff,

    Eof,
}

#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    pub line: usize,
    pub column: usize,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("lex error at {line}:{column}: {message}")]
pub struct LexError {
    pub message: String,
    pub line: usize,
    pub column: usize,
}

fn keyword(ident: &str) -> Option<TokenKind> {
    use TokenKind::*;
    Some(match ident {
        "var" => KwVar,
        "type" => KwType,
        "fun" => KwFun,
        "struct" => KwStruct,
        "union" => KwUnion,
        "enum" => KwEnum,
        "if" => KwIf,
        "else" => KwElse,
        "while" => KwWhile,
        "for" => KwFor,
        "in" => KwIn,
        "where" => KwWhere,
        "break" => KwBreak,
        "continue" => KwContinue,
        "return" => KwReturn,
        "try" => KwTry,
        "catch" => KwCatch,
        "until" => KwUntil,
        "raise" => KwRaise,
        "print" => KwPrint,
        "printf" => KwPrintln,
        "isa" => KwIsa,
        "pinned" => KwPinned,
        "method" => KwMethod,
        "int" => KwInt,
        "uint" => KwUint,
        "long" => KwLong,
        "ulong" => KwUlong,
        "string" => KwString,
        "void" => KwVoid,
        "any" => KwAny,
        "off" => KwOff,
        _ => return None,
    })
}

/// Tokenizes an entire source buffer up front. The lexer only ever reads
/// a buffer — `compile_file` reads the file into one first.
pub fn tokenize(src: &str) -> Result<Vec<Token>, LexError> {
    let mut tokens = Vec::new();
    let bytes: Vec<char> = src.chars().collect();
    let mut i = 0usize;
    let mut line = 1usize;
    let mut col = 1usize;

    macro_rules! push {
        ($kind:expr, $len:expr) => {{
            tokens.push(Token { kind: $kind, line, column: col });
            for _ in 0..$len {
                advance(&bytes, &mut i, &mut line, &mut col);
            }
        }};
    }

    while i < bytes.len() {
        let c = bytes[i];
        if c == '\n' {
            advance(&bytes, &mut i, &mut line, &mut col);
            continue;
        }
        if c.is_whitespace() {
            advance(&bytes, &mut i, &mut line, &mut col);
            continue;
        }
        // line comments: // ... and # ...
        if c == '/' && i + 1 < bytes.len() && bytes[i + 1] == '/' {
            while i < bytes.len() && bytes[i] != '\n' {
                advance(&bytes, &mut i, &mut line, &mut col);
            }
            continue;
        }
        if c == '/' && i + 1 < bytes.len() && bytes[i + 1] == '*' {
            advance(&bytes, &mut i, &mut line, &mut col);
            advance(&bytes, &mut i, &mut line, &mut col);
            while i + 1 < bytes.len() && !(bytes[i] == '*' && bytes[i + 1] == '/') {
                advance(&bytes, &mut i, &mut line, &mut col);
            }
            advance(&bytes, &mut i, &mut line, &mut col);
            advance(&bytes, &mut i, &mut line, &mut col);
            continue;
        }

        if c.is_ascii_digit() {
            let (start_line, start_col) = (line, col);
            let mut lexeme = String::new();
            if c == '0' && i + 1 < bytes.len() && (bytes[i + 1] == 'x' || bytes[i + 1] == 'X') {
                lexeme.push(bytes[i]);
                lexeme.push(bytes[i + 1]);
                advance(&bytes, &mut i, &mut line, &mut col);
                advance(&bytes, &mut i, &mut line, &mut col);
                while i < bytes.len() && (bytes[i].is_ascii_hexdigit() || bytes[i] == '_') {
                    lexeme.push(bytes[i]);
                    advance(&bytes, &mut i, &mut line, &mut col);
                }
                let v = i64::from_str_radix(&lexeme[2..].replace('_', ""), 16).map_err(|_| {
                    LexError { message: format!("bad hex literal `{lexeme}`"), line: start_line, column: start_col }
                })?;
                tokens.push(Token { kind: TokenKind::Int(v), line: start_line, column: start_col });
                continue;
            }
            if c == '0' && i + 1 < bytes.len() && (bytes[i + 1] == 'b' || bytes[i + 1] == 'B') {
                lexeme.push(bytes[i]);
                lexeme.push(bytes[i + 1]);
                advance(&bytes, &mut i, &mut line, &mut col);
                advance(&bytes, &mut i, &mut line, &mut col);
                while i < bytes.len() && (bytes[i] == '0' || bytes[i] == '1' || bytes[i] == '_') {
                    lexeme.push(bytes[i]);
                    advance(&bytes, &mut i, &mut line, &mut col);
                }
                let v = i64::from_str_radix(&lexeme[2..].replace('_', ""), 2).map_err(|_| {
                    LexError { message: format!("bad binary literal `{lexeme}`"), line: start_line, column: start_col }
                })?;
                tokens.push(Token { kind: TokenKind::Int(v), line: start_line, column: start_col });
                continue;
            }
            while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == '_') {
                lexeme.push(bytes[i]);
                advance(&bytes, &mut i, &mut line, &mut col);
            }
            let v: i64 = lexeme.replace('_', "").parse().map_err(|_| LexError {
                message: format!("bad integer literal `{lexeme}`"),
                line: start_line,
                column: start_col,
            })?;
            tokens.push(Token { kind: TokenKind::Int(v), line: start_line, column: start_col });
            continue;
        }

        if c.is_alphabetic() || c == '_' {
            let (start_line, start_col) = (line, col);
            let mut lexeme = String::new();
            while i < bytes.len() && (bytes[i].is_alphanumeric() || bytes[i] == '_') {
                lexeme.push(bytes[i]);
                advance(&bytes, &mut i, &mut line, &mut col);
            }
            let kind = keyword(&lexeme).unwrap_or(TokenKind::Ident(lexeme));
            tokens.push(Token { kind, line: start_line, column: start_col });
            continue;
        }

        if c == '$' {
            let (start_line, start_col) = (line, col);
            advance(&bytes, &mut i, &mut line, &mut col);
            let mut lexeme = String::new();
            while i < bytes.len() && (bytes[i].is_alphanumeric() || bytes[i] == '_') {
                lexeme.push(bytes[i]);
                advance(&bytes, &mut i, &mut line, &mut col);
            }
            tokens.push(Token { kind: TokenKind::Alien(lexeme), line: start_line, column: start_col });
            continue;
        }

        if c == '"' {
            let (start_line, start_col) = (line, col);
            advance(&bytes, &mut i, &mut line, &mut col);
            let mut s = String::new();
            while i < bytes.len() && bytes[i] != '"' {
                if bytes[i] == '\\' && i + 1 < bytes.len() {
                    advance(&bytes, &mut i, &mut line, &mut col);
                    let esc = bytes[i];
                    s.push(match esc {
                        'n' => '\n',
                        't' => '\t',
                        '0' => '\0',
                        '\\' => '\\',
                        '"' => '"',
                        other => other,
                    });
                    advance(&bytes, &mut i, &mut line, &mut col);
                } else {
                    s.push(bytes[i]);
                    advance(&bytes, &mut i, &mut line, &mut col);
                }
            }
            if i >= bytes.len() {
                return Err(LexError { message: "unterminated string literal".into(), line: start_line, column: start_col });
            }
            advance(&bytes, &mut i, &mut line, &mut col); // closing quote
            tokens.push(Token { kind: TokenKind::Str(s), line: start_line, column: start_col });
            continue;
        }

        macro_rules! two {
            ($next:expr, $two_kind:expr, $one_kind:expr) => {{
                if i + 1 < bytes.len() && bytes[i + 1] == $next {
                    push!($two_kind, 2);
                } else {
                    push!($one_kind, 1);
                }
            }};
        }

        match c {
            '+' => two!('+', TokenKind::PlusPlus, TokenKind::Plus),
            '-' => {
                if i + 1 < bytes.len() && bytes[i + 1] == '-' {
                    push!(TokenKind::MinusMinus, 2);
                } else if i + 1 < bytes.len() && bytes[i + 1] == '>' {
                    push!(TokenKind::Arrow, 2);
                } else {
                    push!(TokenKind::Minus, 1);
                }
            }
            '*' => push!(TokenKind::Star, 1),
            '/' => push!(TokenKind::Slash, 1),
            '%' => push!(TokenKind::Percent, 1),
            '&' => two!('&', TokenKind::AndAnd, TokenKind::Amp),
            '|' => two!('|', TokenKind::OrOr, TokenKind::Pipe),
            '^' => push!(TokenKind::Caret, 1),
            '~' => push!(TokenKind::Tilde, 1),
            '!' => two!('=', TokenKind::Ne, TokenKind::Bang),
            '<' => {
                if i + 1 < bytes.len() && bytes[i + 1] == '<' {
                    push!(TokenKind::Shl, 2);
                } else if i + 1 < bytes.len() && bytes[i + 1] == '=' {
                    push!(TokenKind::Le, 2);
                } else {
                    push!(TokenKind::Lt, 1);
                }
            }
            '>' => {
                if i + 1 < bytes.len() && bytes[i + 1] == '>' {
                    push!(TokenKind::Shr, 2);
                } else if i + 1 < bytes.len() && bytes[i + 1] == '=' {
                    push!(TokenKind::Ge, 2);
                } else {
                    push!(TokenKind::Gt, 1);
                }
            }
            '=' => two!('=', TokenKind::EqEq, TokenKind::Eq),
            '?' => push!(TokenKind::Question, 1),
            ':' => two!(':', TokenKind::ColonColon, TokenKind::Colon),
            ';' => push!(TokenKind::Semi, 1),
            ',' => push!(TokenKind::Comma, 1),
            '.' => push!(TokenKind::Dot, 1),
            '@' => push!(TokenKind::At, 1),
            '#' => push!(TokenKind::Hash, 1),
            '(' => push!(TokenKind::LParen, 1),
            ')' => push!(TokenKind::RParen, 1),
            '{' => push!(TokenKind::LBrace, 1),
            '}' => push!(TokenKind::RBrace, 1),
            '[' => push!(TokenKind::LBracket, 1),
            ']' => push!(TokenKind::RBracket, 1),
            other => {
                return Err(LexError {
                    message: format!("unexpected character `{other}`"),
                    line,
                    column: col,
                });
            }
        }
    }

    tokens.push(Token { kind: TokenKind::Eof, line, column: col });
    Ok(tokens)
}

fn advance(bytes: &[char], i: &mut usize, line: &mut usize, col: &mut usize) {
    if *i < bytes.len() {
        if bytes[*i] == '\n' {
            *line += 1;
            *col = 1;
        } else {
            *col += 1;
        }
        *i += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizes_var_decl() {
        let toks = tokenize("var x = 42;").unwrap();
        let kinds: Vec<_> = toks.iter().map(|t| &t.kind).collect();
        assert_eq!(
            kinds,
            vec![
                &TokenKind::KwVar,
                &TokenKind::Ident("x".into()),
                &TokenKind::Eq,
                &TokenKind::Int(42),
                &TokenKind::Semi,
                &TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn tokenizes_hex_and_string() {
        let toks = tokenize(r#"0xdeadbeef "hi\n""#).unwrap();
        assert!(matches!(toks[0].kind, TokenKind::Int(0xdeadbeef)));
        assert!(matches!(&toks[1].kind, TokenKind::Str(s) if s == "hi\n"));
    }

    #[test]
    fn alien_token_lexes_distinctly() {
        let toks = tokenize("$foo").unwrap();
        assert!(matches!(&toks[0].kind, TokenKind::Alien(s) if s == "foo"));
    }
}
