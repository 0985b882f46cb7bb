//! Lexer for the C-like kernel language using logos
//!
//! Supports tokens like:
//! - Identifiers: A, matrixMultiply, a_idx
//! - Integer literals: 0, 42 (floating literals are tokenized so they can be rejected later)
//! - Operators: + - * / % and their compound assignments, ++, comparisons, bitwise ops
//! - Punctuation: ( ) [ ] { } , ;
//! - Keywords: types, `for`, and the control-flow keywords kernels may not use
//!
//! Whitespace, comments and preprocessor lines are skipped.

use std::ops::Range;

use logos::Logos;

use crate::error::{CompileError, CompileResult};

/// Token types for the kernel language
#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r\n\f]+")]
#[logos(skip r"//[^\n]*")]
#[logos(skip r"/\*([^*]|\*+[^*/])*\*+/")]
#[logos(skip r"#[^\n]*")]
pub enum Token {
    // Literals
    #[regex(r"[0-9]+", |lex| lex.slice().parse::<i64>().ok())]
    Integer(i64),

    #[regex(r"[0-9]+\.[0-9]*([eE][+-]?[0-9]+)?[fF]?", |lex| {
        lex.slice().trim_end_matches(['f', 'F']).parse::<f64>().ok()
    })]
    Float(f64),

    #[regex(r"[a-zA-Z_][a-zA-Z0-9_]*", |lex| lex.slice().to_string())]
    Ident(String),

    // Type keywords
    #[token("void")]
    Void,
    #[token("char")]
    Char,
    #[token("short")]
    Short,
    #[token("int")]
    Int,
    #[token("long")]
    Long,
    #[token("float")]
    FloatType,
    #[token("double")]
    Double,
    #[token("unsigned")]
    Unsigned,
    #[token("signed")]
    Signed,
    #[token("const")]
    Const,

    // Statement keywords
    #[token("for")]
    For,
    #[token("if")]
    If,
    #[token("else")]
    Else,
    #[token("while")]
    While,
    #[token("do")]
    Do,
    #[token("return")]
    Return,
    #[token("break")]
    Break,
    #[token("continue")]
    Continue,

    // Assignment operators
    #[token("=")]
    Assign,
    #[token("+=")]
    PlusAssign,
    #[token("-=")]
    MinusAssign,
    #[token("*=")]
    StarAssign,
    #[token("/=")]
    SlashAssign,
    #[token("%=")]
    PercentAssign,
    #[token("++")]
    Increment,
    #[token("--")]
    Decrement,

    // Arithmetic and bitwise operators
    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("/")]
    Slash,
    #[token("%")]
    Percent,
    #[token("&")]
    Amp,
    #[token("|")]
    Pipe,
    #[token("^")]
    Caret,
    #[token("~")]
    Tilde,
    #[token("<<")]
    Shl,
    #[token(">>")]
    Shr,

    // Comparison and logical operators
    #[token("<")]
    Lt,
    #[token("<=")]
    Le,
    #[token(">")]
    Gt,
    #[token(">=")]
    Ge,
    #[token("==")]
    EqEq,
    #[token("!=")]
    NotEq,
    #[token("&&")]
    AndAnd,
    #[token("||")]
    OrOr,
    #[token("!")]
    Bang,

    // Punctuation
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,
    #[token(",")]
    Comma,
    #[token(";")]
    Semicolon,
}

impl Token {
    /// True for tokens that can start a type specifier.
    pub fn starts_type(&self) -> bool {
        matches!(
            self,
            Token::Void
                | Token::Char
                | Token::Short
                | Token::Int
                | Token::Long
                | Token::FloatType
                | Token::Double
                | Token::Unsigned
                | Token::Signed
                | Token::Const
        )
    }
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Token::Integer(n) => return write!(f, "{}", n),
            Token::Float(n) => return write!(f, "{}", n),
            Token::Ident(s) => return write!(f, "{}", s),
            Token::Void => "void",
            Token::Char => "char",
            Token::Short => "short",
            Token::Int => "int",
            Token::Long => "long",
            Token::FloatType => "float",
            Token::Double => "double",
            Token::Unsigned => "unsigned",
            Token::Signed => "signed",
            Token::Const => "const",
            Token::For => "for",
            Token::If => "if",
            Token::Else => "else",
            Token::While => "while",
            Token::Do => "do",
            Token::Return => "return",
            Token::Break => "break",
            Token::Continue => "continue",
            Token::Assign => "=",
            Token::PlusAssign => "+=",
            Token::MinusAssign => "-=",
            Token::StarAssign => "*=",
            Token::SlashAssign => "/=",
            Token::PercentAssign => "%=",
            Token::Increment => "++",
            Token::Decrement => "--",
            Token::Plus => "+",
            Token::Minus => "-",
            Token::Star => "*",
            Token::Slash => "/",
            Token::Percent => "%",
            Token::Amp => "&",
            Token::Pipe => "|",
            Token::Caret => "^",
            Token::Tilde => "~",
            Token::Shl => "<<",
            Token::Shr => ">>",
            Token::Lt => "<",
            Token::Le => "<=",
            Token::Gt => ">",
            Token::Ge => ">=",
            Token::EqEq => "==",
            Token::NotEq => "!=",
            Token::AndAnd => "&&",
            Token::OrOr => "||",
            Token::Bang => "!",
            Token::LParen => "(",
            Token::RParen => ")",
            Token::LBracket => "[",
            Token::RBracket => "]",
            Token::LBrace => "{",
            Token::RBrace => "}",
            Token::Comma => ",",
            Token::Semicolon => ";",
        };
        f.write_str(text)
    }
}

/// A token together with its byte range in the source
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub span: Range<usize>,
}

/// Lexer wrapper that provides a stream of spanned tokens
pub struct Lexer<'source> {
    inner: logos::Lexer<'source, Token>,
    peeked: Option<Option<CompileResult<Spanned>>>,
}

impl<'source> Lexer<'source> {
    pub fn new(source: &'source str) -> Self {
        Self {
            inner: Token::lexer(source),
            peeked: None,
        }
    }

    /// Peek at the next token without consuming it
    pub fn peek(&mut self) -> Option<&CompileResult<Spanned>> {
        if self.peeked.is_none() {
            let next = self.lex_next();
            self.peeked = Some(next);
        }
        self.peeked.as_ref().and_then(|p| p.as_ref())
    }

    /// Check if the next token matches expected
    pub fn check(&mut self, expected: &Token) -> bool {
        matches!(self.peek(), Some(Ok(spanned)) if &spanned.token == expected)
    }

    fn lex_next(&mut self) -> Option<CompileResult<Spanned>> {
        let result = self.inner.next()?;
        let span = self.inner.span();
        Some(match result {
            Ok(token) => Ok(Spanned { token, span }),
            Err(()) => Err(CompileError::lexer(
                span.start,
                format!("unexpected input `{}`", self.inner.slice()),
            )),
        })
    }
}

impl<'source> Iterator for Lexer<'source> {
    type Item = CompileResult<Spanned>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.peeked.take() {
            Some(peeked) => peeked,
            None => self.lex_next(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(source: &str) -> Vec<Token> {
        Lexer::new(source)
            .map(|t| t.map(|s| s.token))
            .collect::<CompileResult<Vec<_>>>()
            .unwrap()
    }

    #[test]
    fn test_accumulation_statement() {
        assert_eq!(
            tokens("C[i][j] += A[i][k] * B[k][j];"),
            vec![
                Token::Ident("C".to_string()),
                Token::LBracket,
                Token::Ident("i".to_string()),
                Token::RBracket,
                Token::LBracket,
                Token::Ident("j".to_string()),
                Token::RBracket,
                Token::PlusAssign,
                Token::Ident("A".to_string()),
                Token::LBracket,
                Token::Ident("i".to_string()),
                Token::RBracket,
                Token::LBracket,
                Token::Ident("k".to_string()),
                Token::RBracket,
                Token::Star,
                Token::Ident("B".to_string()),
                Token::LBracket,
                Token::Ident("k".to_string()),
                Token::RBracket,
                Token::LBracket,
                Token::Ident("j".to_string()),
                Token::RBracket,
                Token::Semicolon,
            ]
        );
    }

    #[test]
    fn test_for_header() {
        assert_eq!(
            tokens("for (int i = 0; i < 10; i++)"),
            vec![
                Token::For,
                Token::LParen,
                Token::Int,
                Token::Ident("i".to_string()),
                Token::Assign,
                Token::Integer(0),
                Token::Semicolon,
                Token::Ident("i".to_string()),
                Token::Lt,
                Token::Integer(10),
                Token::Semicolon,
                Token::Ident("i".to_string()),
                Token::Increment,
                Token::RParen,
            ]
        );
    }

    #[test]
    fn test_skips_comments_and_preprocessor() {
        let source = "#include <iostream>\n// line comment\nint /* block\n comment */ x;";
        assert_eq!(
            tokens(source),
            vec![Token::Int, Token::Ident("x".to_string()), Token::Semicolon]
        );
    }

    #[test]
    fn test_keyword_prefix_is_identifier() {
        assert_eq!(
            tokens("format integer"),
            vec![
                Token::Ident("format".to_string()),
                Token::Ident("integer".to_string()),
            ]
        );
    }

    #[test]
    fn test_float_literal() {
        assert_eq!(tokens("2.5f"), vec![Token::Float(2.5)]);
    }

    #[test]
    fn test_invalid_character_reports_position() {
        let err = Lexer::new("int $x;")
            .collect::<CompileResult<Vec<_>>>()
            .unwrap_err();
        assert_eq!(
            err,
            CompileError::LexerError {
                position: 4,
                message: "unexpected input `$`".to_string(),
            }
        );
    }
}
