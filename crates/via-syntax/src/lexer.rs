//! Lexer (§4.1): a hand-written scanner with one/two-character lookahead.
//! Total and infallible — every byte sequence produces a token vector ending
//! in `EOF` (§8 property 1); unrecognized bytes become `Illegal` tokens
//! rather than errors.

use crate::token::{Keyword, Punct, Token, TokenKind};
use via_core::Span;

/// Scans an entire source string into a flat token vector, terminated by a
/// single `EOF` token (§3.1, §4.1). Cannot fail.
#[must_use]
pub fn lex(src: &str) -> Vec<Token<'_>> {
    let mut lexer = Lexer::new(src);
    let mut tokens = Vec::new();
    loop {
        let token = lexer.next_token();
        let is_eof = token.is_eof();
        tokens.push(token);
        if is_eof {
            break;
        }
    }
    tokens
}

struct Lexer<'a> {
    src: &'a str,
    pos: usize,
    line: u32,
    column: u32,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Self { src, pos: 0, line: 1, column: 1 }
    }

    fn peek(&self) -> Option<char> {
        self.peek_at(0)
    }

    fn peek_at(&self, k: usize) -> Option<char> {
        self.src[self.pos..].chars().nth(k)
    }

    fn bump(&mut self) -> Option<char> {
        let ch = self.peek()?;
        self.pos += ch.len_utf8();
        if ch == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(ch)
    }

    fn span_from(&self, begin: usize, begin_line: u32, begin_column: u32) -> Span {
        Span::new(begin_line, begin_column, begin as u32, self.pos as u32)
    }

    fn skip_trivia(&mut self) {
        loop {
            match self.peek() {
                Some(c) if c.is_whitespace() => {
                    self.bump();
                }
                Some('#') if self.peek_at(1) == Some('#') => {
                    // line comment: `## ... \n`
                    while let Some(c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                Some('#') if self.peek_at(1) == Some('[') => {
                    // block comment: `#[ ... ]#`, nested tracking of line numbers only
                    self.bump();
                    self.bump();
                    loop {
                        match self.peek() {
                            None => break,
                            Some(']') if self.peek_at(1) == Some('#') => {
                                self.bump();
                                self.bump();
                                break;
                            }
                            Some(_) => {
                                self.bump();
                            }
                        }
                    }
                }
                _ => break,
            }
        }
    }

    fn next_token(&mut self) -> Token<'a> {
        self.skip_trivia();
        let begin = self.pos;
        let begin_line = self.line;
        let begin_column = self.column;

        let Some(c) = self.peek() else {
            let span = self.span_from(begin, begin_line, begin_column);
            return Token::new(TokenKind::Eof, "", span);
        };

        if c.is_ascii_digit() {
            return self.lex_number(begin, begin_line, begin_column);
        }
        if is_ident_start(c) {
            return self.lex_identifier(begin, begin_line, begin_column);
        }
        if c == '"' {
            return self.lex_string(begin, begin_line, begin_column);
        }

        self.lex_punct(begin, begin_line, begin_column)
    }

    fn lex_number(&mut self, begin: usize, begin_line: u32, begin_column: u32) -> Token<'a> {
        let mut is_float = false;
        if self.peek() == Some('0') && matches!(self.peek_at(1), Some('x' | 'X')) {
            self.bump();
            self.bump();
            while matches!(self.peek(), Some(c) if c.is_ascii_hexdigit()) {
                self.bump();
            }
        } else if self.peek() == Some('0') && matches!(self.peek_at(1), Some('b' | 'B')) {
            self.bump();
            self.bump();
            while matches!(self.peek(), Some('0' | '1')) {
                self.bump();
            }
        } else {
            while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
                self.bump();
            }
            if self.peek() == Some('.') && matches!(self.peek_at(1), Some(c) if c.is_ascii_digit()) {
                is_float = true;
                self.bump();
                while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
                    self.bump();
                }
            }
        }

        let span = self.span_from(begin, begin_line, begin_column);
        let kind = if is_float { TokenKind::Float } else { TokenKind::Int };
        Token::new(kind, &self.src[begin..self.pos], span)
    }

    fn lex_identifier(&mut self, begin: usize, begin_line: u32, begin_column: u32) -> Token<'a> {
        while matches!(self.peek(), Some(c) if is_ident_continue(c)) {
            self.bump();
        }
        // trailing `!` is allowed (§4.1: "macro-style names")
        if self.peek() == Some('!') {
            self.bump();
        }

        let lexeme = &self.src[begin..self.pos];
        let span = self.span_from(begin, begin_line, begin_column);
        let kind = match lexeme {
            "true" => TokenKind::True,
            "false" => TokenKind::False,
            "nil" => TokenKind::Nil,
            _ => Keyword::lookup(lexeme).map_or(TokenKind::Identifier, TokenKind::Keyword),
        };
        Token::new(kind, lexeme, span)
    }

    fn lex_string(&mut self, begin: usize, begin_line: u32, begin_column: u32) -> Token<'a> {
        self.bump(); // opening quote
        loop {
            match self.peek() {
                None => break,
                Some('"') => {
                    self.bump();
                    break;
                }
                Some('\\') => {
                    self.bump();
                    if self.peek().is_some() {
                        self.bump(); // escaped character, decoded later by the parser
                    }
                }
                Some(_) => {
                    self.bump();
                }
            }
        }
        let span = self.span_from(begin, begin_line, begin_column);
        Token::new(TokenKind::String, &self.src[begin..self.pos], span)
    }

    fn lex_punct(&mut self, begin: usize, begin_line: u32, begin_column: u32) -> Token<'a> {
        let c = self.bump().expect("checked by caller");
        let next = self.peek();

        let two_char = |lexer: &mut Self| {
            lexer.bump();
        };

        let punct = match (c, next) {
            ('(', _) => Punct::LParen,
            (')', _) => Punct::RParen,
            ('{', _) => Punct::LBrace,
            ('}', _) => Punct::RBrace,
            ('[', _) => Punct::LBracket,
            (']', _) => Punct::RBracket,
            (',', _) => Punct::Comma,
            (';', _) => Punct::Semicolon,
            (':', _) => Punct::Colon,
            ('.', Some('.')) => {
                two_char(self);
                Punct::DotDot
            }
            ('.', _) => Punct::Dot,
            ('@', _) => Punct::At,
            ('#', _) => Punct::Hash,
            ('?', _) => Punct::Question,
            ('=', Some('=')) => {
                two_char(self);
                Punct::EqEq
            }
            ('=', _) => Punct::Assign,
            ('!', Some('=')) => {
                two_char(self);
                Punct::NotEq
            }
            ('<', Some('=')) => {
                two_char(self);
                Punct::LtEq
            }
            ('<', _) => Punct::Lt,
            ('>', Some('=')) => {
                two_char(self);
                Punct::GtEq
            }
            ('>', _) => Punct::Gt,
            ('-', Some('>')) => {
                two_char(self);
                Punct::Arrow
            }
            ('-', Some('-')) => {
                two_char(self);
                Punct::MinusMinus
            }
            ('-', Some('=')) => {
                two_char(self);
                Punct::MinusAssign
            }
            ('-', _) => Punct::Minus,
            ('+', Some('+')) => {
                two_char(self);
                Punct::PlusPlus
            }
            ('+', Some('=')) => {
                two_char(self);
                Punct::PlusAssign
            }
            ('+', _) => Punct::Plus,
            ('*', Some('=')) => {
                two_char(self);
                Punct::StarAssign
            }
            ('*', _) => Punct::Star,
            ('/', Some('=')) => {
                two_char(self);
                Punct::SlashAssign
            }
            ('/', _) => Punct::Slash,
            ('%', Some('=')) => {
                two_char(self);
                Punct::PercentAssign
            }
            ('%', _) => Punct::Percent,
            ('^', Some('=')) => {
                two_char(self);
                Punct::CaretAssign
            }
            ('^', _) => Punct::Caret,
            _ => {
                let span = self.span_from(begin, begin_line, begin_column);
                return Token::new(TokenKind::Illegal, &self.src[begin..self.pos], span);
            }
        };

        let span = self.span_from(begin, begin_line, begin_column);
        Token::new(TokenKind::Punct(punct), &self.src[begin..self.pos], span)
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_continue(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn kinds(src: &str) -> Vec<TokenKind> {
        lex(src).into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn lexes_empty_input_to_eof_only() {
        assert_eq!(kinds(""), vec![TokenKind::Eof]);
    }

    #[test]
    fn lexes_integer_and_float() {
        assert_eq!(kinds("10 3.5"), vec![TokenKind::Int, TokenKind::Float, TokenKind::Eof]);
    }

    #[test]
    fn lexes_hex_and_binary_prefixes() {
        let toks = lex("0xFF 0b101");
        assert_eq!(toks[0].kind, TokenKind::Int);
        assert_eq!(toks[0].lexeme, "0xFF");
        assert_eq!(toks[1].kind, TokenKind::Int);
        assert_eq!(toks[1].lexeme, "0b101");
    }

    #[test]
    fn promotes_keywords() {
        assert_eq!(kinds("local global fn"), vec![
            TokenKind::Keyword(Keyword::Local),
            TokenKind::Keyword(Keyword::Global),
            TokenKind::Keyword(Keyword::Fn),
            TokenKind::Eof,
        ]);
    }

    #[test]
    fn promotes_literal_keywords() {
        assert_eq!(kinds("true false nil"), vec![TokenKind::True, TokenKind::False, TokenKind::Nil, TokenKind::Eof]);
    }

    #[test]
    fn identifiers_may_end_in_bang() {
        let toks = lex("reset!");
        assert_eq!(toks[0].kind, TokenKind::Identifier);
        assert_eq!(toks[0].lexeme, "reset!");
    }

    #[test]
    fn two_char_compounds_are_single_tokens() {
        assert_eq!(kinds("== != <= >= ++ -- -> .."), vec![
            TokenKind::Punct(Punct::EqEq),
            TokenKind::Punct(Punct::NotEq),
            TokenKind::Punct(Punct::LtEq),
            TokenKind::Punct(Punct::GtEq),
            TokenKind::Punct(Punct::PlusPlus),
            TokenKind::Punct(Punct::MinusMinus),
            TokenKind::Punct(Punct::Arrow),
            TokenKind::Punct(Punct::DotDot),
            TokenKind::Eof,
        ]);
    }

    #[test]
    fn line_comments_are_skipped() {
        assert_eq!(kinds("1 ## comment\n2"), vec![TokenKind::Int, TokenKind::Int, TokenKind::Eof]);
    }

    #[test]
    fn block_comments_are_skipped() {
        assert_eq!(kinds("1 #[ a block\ncomment ]# 2"), vec![TokenKind::Int, TokenKind::Int, TokenKind::Eof]);
    }

    #[test]
    fn unknown_byte_becomes_illegal_not_an_error() {
        assert_eq!(kinds("$"), vec![TokenKind::Illegal, TokenKind::Eof]);
    }

    #[test]
    fn every_token_span_is_within_source() {
        let src = "local x = 10 + 2 ## trailing\n";
        for tok in lex(src) {
            assert!(tok.span.begin as usize <= src.len());
            assert!(tok.span.end as usize <= src.len());
            assert!(tok.span.begin <= tok.span.end);
        }
    }

    #[test]
    fn string_literal_keeps_raw_escapes_for_parser_to_decode() {
        let toks = lex(r#""a\nb""#);
        assert_eq!(toks[0].kind, TokenKind::String);
        assert_eq!(toks[0].lexeme, r#""a\nb""#);
    }
}
