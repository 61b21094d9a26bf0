//! Glob matching for pattern subscriptions.
//!
//! Supports `*`, `?`, character classes (`[abc]`, `[^abc]`, `[a-z]`) and
//! backslash escapes.

/// Does `channel` match the glob `pattern`?
///
/// Runs in `O(pattern * channel)`: on a mismatch the matcher only backtracks
/// to the most recent `*`.
pub fn pattern_matches(pattern: &str, channel: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let tokens = tokenize(&pattern);
    let channel: Vec<char> = channel.chars().collect();

    let (mut t, mut c) = (0, 0);
    // Token after the last star, and where that star's match currently ends.
    let mut star: Option<(usize, usize)> = None;
    while c < channel.len() {
        match tokens.get(t) {
            Some(Token::Star) => {
                t += 1;
                star = Some((t, c));
            }
            Some(token) if token.accepts(channel[c]) => {
                t += 1;
                c += 1;
            }
            _ => match star {
                Some((after, end)) => {
                    t = after;
                    c = end + 1;
                    star = Some((after, c));
                }
                None => return false,
            },
        }
    }
    tokens[t..].iter().all(|token| matches!(token, Token::Star))
}

enum Token {
    Star,
    Any,
    Class(CharClass),
    Literal(char),
}

impl Token {
    fn accepts(&self, c: char) -> bool {
        match self {
            Token::Star | Token::Any => true,
            Token::Class(class) => class.accepts(c),
            Token::Literal(literal) => *literal == c,
        }
    }
}

fn tokenize(pattern: &[char]) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut rest = pattern;
    while let Some((&head, tail)) = rest.split_first() {
        rest = tail;
        let token = match head {
            '*' => Token::Star,
            '?' => Token::Any,
            '[' => {
                let (class, after) = parse_class(tail);
                rest = after;
                Token::Class(class)
            }
            '\\' if !tail.is_empty() => {
                rest = &tail[1..];
                Token::Literal(tail[0])
            }
            literal => Token::Literal(literal),
        };
        tokens.push(token);
    }
    tokens
}

struct CharClass {
    negated: bool,
    ranges: Vec<(char, char)>,
}

impl CharClass {
    fn accepts(&self, c: char) -> bool {
        let hit = self.ranges.iter().any(|&(lo, hi)| lo <= c && c <= hi);
        hit != self.negated
    }
}

/// Parse the body of a `[...]` class. `pattern` starts just after `[`;
/// returns the class and the remainder after the closing `]`. An unclosed
/// class consumes the rest of the pattern.
fn parse_class(pattern: &[char]) -> (CharClass, &[char]) {
    let mut i = 0;
    let negated = pattern.first() == Some(&'^');
    if negated {
        i += 1;
    }

    let mut ranges = Vec::new();
    while i < pattern.len() && pattern[i] != ']' {
        let mut lo = pattern[i];
        if lo == '\\' && i + 1 < pattern.len() {
            i += 1;
            lo = pattern[i];
        }
        if i + 2 < pattern.len() && pattern[i + 1] == '-' && pattern[i + 2] != ']' {
            let hi = pattern[i + 2];
            ranges.push(if lo <= hi { (lo, hi) } else { (hi, lo) });
            i += 3;
        } else {
            ranges.push((lo, lo));
            i += 1;
        }
    }

    let after = if i < pattern.len() { &pattern[i + 1..] } else { &pattern[pattern.len()..] };
    (CharClass { negated, ranges }, after)
}
