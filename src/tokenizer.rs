use super::token::{keyword_type, Token, TokenType};

/// Lazy token producer over a source buffer. Stateless beyond
/// `(start, current, line)`; restartable at any `Token` boundary.
pub struct Tokenizer<'a> {
    source: &'a str,
    start: usize,
    current: usize,
    line: u32,
}

impl<'a> Tokenizer<'a> {
    pub fn new(source: &'a str) -> Self {
        Tokenizer {
            source,
            start: 0,
            current: 0,
            line: 1,
        }
    }

    fn at_end(&self) -> bool {
        self.current >= self.source.len()
    }

    fn peek(&self) -> u8 {
        if self.at_end() {
            0
        } else {
            self.source.as_bytes()[self.current]
        }
    }

    fn peek_next(&self) -> u8 {
        if self.current + 1 >= self.source.len() {
            0
        } else {
            self.source.as_bytes()[self.current + 1]
        }
    }

    fn advance(&mut self) -> u8 {
        let c = self.peek();
        self.current += 1;
        if c == b'\n' {
            self.line += 1;
        }
        c
    }

    fn matches(&mut self, expected: u8) -> bool {
        if self.at_end() || self.peek() != expected {
            return false;
        }
        self.current += 1;
        true
    }

    fn skip_whitespace(&mut self) {
        loop {
            match self.peek() {
                b' ' | b'\r' | b'\t' | b'\n' => {
                    self.advance();
                }
                b'/' if self.peek_next() == b'/' => {
                    while self.peek() != b'\n' && !self.at_end() {
                        self.advance();
                    }
                }
                _ => return,
            }
        }
    }

    fn lexeme(&self) -> &'a str {
        &self.source[self.start..self.current]
    }

    fn make(&self, typ: TokenType) -> Token<'a> {
        Token::new(typ, self.lexeme(), self.line)
    }

    fn error(&self, message: &'static str) -> Token<'a> {
        Token::new(TokenType::Error, message, self.line)
    }

    fn string(&mut self) -> Token<'a> {
        while self.peek() != b'"' && !self.at_end() {
            self.advance();
        }
        if self.at_end() {
            return self.error("Unterminated string.");
        }
        self.advance(); // closing quote
        self.make(TokenType::String)
    }

    fn number(&mut self) -> Token<'a> {
        while self.peek().is_ascii_digit() {
            self.advance();
        }
        if self.peek() == b'.' && self.peek_next().is_ascii_digit() {
            self.advance();
            while self.peek().is_ascii_digit() {
                self.advance();
            }
        }
        self.make(TokenType::Number)
    }

    fn identifier(&mut self) -> Token<'a> {
        while {
            let c = self.peek();
            c.is_ascii_alphanumeric() || c == b'_'
        } {
            self.advance();
        }
        let typ = keyword_type(self.lexeme()).unwrap_or(TokenType::Identifier);
        self.make(typ)
    }

    pub fn next_token(&mut self) -> Token<'a> {
        self.skip_whitespace();
        self.start = self.current;

        if self.at_end() {
            return self.make(TokenType::Eof);
        }

        let c = self.advance();

        if c.is_ascii_digit() {
            return self.number();
        }
        if c.is_ascii_alphabetic() || c == b'_' {
            return self.identifier();
        }

        match c {
            b'(' => self.make(TokenType::LeftParen),
            b')' => self.make(TokenType::RightParen),
            b'{' => self.make(TokenType::LeftBrace),
            b'}' => self.make(TokenType::RightBrace),
            b';' => self.make(TokenType::Semicolon),
            b',' => self.make(TokenType::Comma),
            b'.' => self.make(TokenType::Dot),
            b'-' => self.make(TokenType::Minus),
            b'+' => self.make(TokenType::Plus),
            b'/' => self.make(TokenType::Slash),
            b'*' => self.make(TokenType::Star),
            b':' => self.make(TokenType::Colon),
            b'?' => self.make(TokenType::QuestionMark),
            b'!' => {
                let typ = if self.matches(b'=') {
                    TokenType::BangEqual
                } else {
                    TokenType::Bang
                };
                self.make(typ)
            }
            b'=' => {
                let typ = if self.matches(b'=') {
                    TokenType::EqualEqual
                } else {
                    TokenType::Equal
                };
                self.make(typ)
            }
            b'<' => {
                let typ = if self.matches(b'=') {
                    TokenType::LessEqual
                } else {
                    TokenType::Less
                };
                self.make(typ)
            }
            b'>' => {
                let typ = if self.matches(b'=') {
                    TokenType::GreaterEqual
                } else {
                    TokenType::Greater
                };
                self.make(typ)
            }
            b'"' => self.string(),
            _ => self.error("Unexpected character."),
        }
    }
}

impl<'a> Iterator for Tokenizer<'a> {
    type Item = Token<'a>;

    fn next(&mut self) -> Option<Token<'a>> {
        let token = self.next_token();
        if token.typ == TokenType::Eof {
            None
        } else {
            Some(token)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan_all(source: &str) -> Vec<TokenType> {
        let mut tokenizer = Tokenizer::new(source);
        let mut types = Vec::new();
        loop {
            let token = tokenizer.next_token();
            if token.typ == TokenType::Eof {
                break;
            }
            types.push(token.typ);
        }
        types
    }

    #[test]
    fn skips_comments_and_whitespace() {
        let types = scan_all("  // a comment\n  1 + 2 // trailing\n");
        assert_eq!(types, vec![TokenType::Number, TokenType::Plus, TokenType::Number]);
    }

    #[test]
    fn two_char_operators() {
        let types = scan_all("!= == <= >=");
        assert_eq!(
            types,
            vec![
                TokenType::BangEqual,
                TokenType::EqualEqual,
                TokenType::LessEqual,
                TokenType::GreaterEqual,
            ]
        );
    }

    #[test]
    fn keywords_vs_identifiers() {
        let types = scan_all("var x = forest;");
        assert_eq!(
            types,
            vec![
                TokenType::Var,
                TokenType::Identifier,
                TokenType::Equal,
                TokenType::Identifier,
                TokenType::Semicolon,
            ]
        );
    }

    #[test]
    fn unterminated_string_errors() {
        let mut tokenizer = Tokenizer::new("\"abc");
        let token = tokenizer.next_token();
        assert_eq!(token.typ, TokenType::Error);
        assert_eq!(token.lexeme, "Unterminated string.");
    }

    #[test]
    fn number_with_fraction() {
        let mut tokenizer = Tokenizer::new("3.14");
        let token = tokenizer.next_token();
        assert_eq!(token.typ, TokenType::Number);
        assert_eq!(token.lexeme, "3.14");
    }

    #[test]
    fn line_tracking_across_newlines() {
        let mut tokenizer = Tokenizer::new("1\n2\n3");
        assert_eq!(tokenizer.next_token().line, 1);
        assert_eq!(tokenizer.next_token().line, 2);
        assert_eq!(tokenizer.next_token().line, 3);
    }
}
