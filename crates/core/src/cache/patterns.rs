//! Glob matching for keys and pub/sub channels.
//!
//! Follows Redis glob syntax: `*` matches any run of characters (including
//! none), `?` matches exactly one, `[abc]`, `[a-z]` and `[^a]` match one
//! character from a class, and `\` makes the next character literal. An
//! unterminated `[` is literal.

enum Token {
    Star,
    Any,
    Literal(char),
    Class {
        negated: bool,
        ranges: Vec<(char, char)>,
    },
}

impl Token {
    fn matches(&self, ch: char) -> bool {
        match self {
            Token::Star | Token::Any => true,
            Token::Literal(literal) => *literal == ch,
            Token::Class { negated, ranges } => {
                ranges.iter().any(|(low, high)| (*low..=*high).contains(&ch)) != *negated
            }
        }
    }
}

fn tokenize(pattern: &str) -> Vec<Token> {
    let chars: Vec<char> = pattern.chars().collect();
    let mut tokens = Vec::with_capacity(chars.len());
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '*' => tokens.push(Token::Star),
            '?' => tokens.push(Token::Any),
            '\\' if i + 1 < chars.len() => {
                i += 1;
                tokens.push(Token::Literal(chars[i]));
            }
            '[' => match parse_class(&chars[i + 1..]) {
                Some((class, consumed)) => {
                    tokens.push(class);
                    i += consumed;
                }
                None => tokens.push(Token::Literal('[')),
            },
            ch => tokens.push(Token::Literal(ch)),
        }
        i += 1;
    }
    tokens
}

/// Parses the body of a class after its `[`. Returns the class and the
/// number of characters consumed, closing `]` included.
fn parse_class(chars: &[char]) -> Option<(Token, usize)> {
    let negated = chars.first() == Some(&'^');
    let mut i = usize::from(negated);
    let mut ranges = Vec::new();
    while i < chars.len() {
        let low = match chars[i] {
            ']' => return Some((Token::Class { negated, ranges }, i + 1)),
            '\\' if i + 1 < chars.len() => {
                i += 1;
                chars[i]
            }
            ch => ch,
        };
        match (chars.get(i + 1), chars.get(i + 2)) {
            (Some(&'-'), Some(&high)) if high != ']' => {
                ranges.push((low.min(high), low.max(high)));
                i += 3;
            }
            _ => {
                ranges.push((low, low));
                i += 1;
            }
        }
    }
    None
}

/// Checks if a key or channel name matches a glob pattern.
///
/// # Examples
///
/// ```
/// use kvguard_core::cache::pattern_matches;
///
/// assert!(pattern_matches("conversation:*", "conversation:42"));
/// assert!(pattern_matches("user:?", "user:7"));
/// assert!(!pattern_matches("user:?", "user:77"));
/// assert!(pattern_matches("user:[0-9]", "user:7"));
/// assert!(!pattern_matches("user:\\*", "user:7"));
/// ```
pub fn pattern_matches(pattern: &str, candidate: &str) -> bool {
    let tokens = tokenize(pattern);
    let candidate: Vec<char> = candidate.chars().collect();

    let (mut p, mut c) = (0, 0);
    // Position of the last `*` seen and the candidate index it was tried at.
    let mut backtrack: Option<(usize, usize)> = None;

    while c < candidate.len() {
        match tokens.get(p) {
            Some(Token::Star) => {
                backtrack = Some((p, c));
                p += 1;
            }
            Some(token) if token.matches(candidate[c]) => {
                p += 1;
                c += 1;
            }
            _ => match backtrack {
                Some((star, tried)) => {
                    p = star + 1;
                    c = tried + 1;
                    backtrack = Some((star, tried + 1));
                }
                None => return false,
            },
        }
    }

    tokens[p..].iter().all(|token| matches!(token, Token::Star))
}

/// Returns true if the string contains glob metacharacters.
pub fn is_pattern(value: &str) -> bool {
    value.contains(['*', '?', '['])
}

/// Escapes glob metacharacters so `value` matches only itself.
///
/// ```
/// use kvguard_core::cache::{escape_glob, pattern_matches};
///
/// assert_eq!(escape_glob("room[1]*"), "room\\[1\\]\\*");
/// assert!(pattern_matches(&escape_glob("a?b"), "a?b"));
/// assert!(!pattern_matches(&escape_glob("a?b"), "axb"));
/// ```
pub fn escape_glob(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        if matches!(ch, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_match() {
        assert!(pattern_matches("app:user:1", "app:user:1"));
        assert!(!pattern_matches("app:user:1", "app:user:2"));
        assert!(!pattern_matches("app:user", "app:user:1"));
    }

    #[test]
    fn test_trailing_star() {
        assert!(pattern_matches("app:session:*", "app:session:abc"));
        assert!(pattern_matches("app:session:*", "app:session:"));
        assert!(!pattern_matches("app:session:*", "app:owner_sessions:u1"));
    }

    #[test]
    fn test_leading_and_inner_star() {
        assert!(pattern_matches("*:typing", "conversation:1:typing"));
        assert!(pattern_matches("conversation:*:typing", "conversation:1:typing"));
        assert!(!pattern_matches("conversation:*:typing", "conversation:1:delta"));
    }

    #[test]
    fn test_star_backtracking() {
        // The first `b` is a false start; the matcher must retry further on.
        assert!(pattern_matches("a*bc", "abxbc"));
        assert!(pattern_matches("*a*a*", "banana"));
        assert!(!pattern_matches("*a*z", "banana"));
    }

    #[test]
    fn test_question_mark() {
        assert!(pattern_matches("user:?", "user:1"));
        assert!(!pattern_matches("user:?", "user:"));
        assert!(pattern_matches("?:*", "a:anything"));
    }

    #[test]
    fn test_empty_inputs() {
        assert!(pattern_matches("", ""));
        assert!(pattern_matches("*", ""));
        assert!(pattern_matches("**", ""));
        assert!(!pattern_matches("", "x"));
        assert!(!pattern_matches("?", ""));
    }

    #[test]
    fn test_is_pattern() {
        assert!(is_pattern("conversation:*"));
        assert!(is_pattern("user:?"));
        assert!(is_pattern("user:[12]"));
        assert!(!is_pattern("conversation:1"));
    }

    #[test]
    fn test_character_classes() {
        assert!(pattern_matches("user:[12]", "user:2"));
        assert!(!pattern_matches("user:[12]", "user:3"));
        assert!(pattern_matches("user:[a-c]x", "user:bx"));
        assert!(pattern_matches("user:[c-a]x", "user:bx"));
        assert!(pattern_matches("user:[^a]", "user:b"));
        assert!(!pattern_matches("user:[^a]", "user:a"));
        assert!(!pattern_matches("user:[]", "user:a"));
    }

    #[test]
    fn test_unterminated_class_is_literal() {
        assert!(pattern_matches("room[1", "room[1"));
        assert!(!pattern_matches("room[1", "room1"));
    }

    #[test]
    fn test_escapes_match_literally() {
        assert!(pattern_matches(r"a\*b", "a*b"));
        assert!(!pattern_matches(r"a\*b", "axxb"));
        assert!(pattern_matches(r"a\[1\]", "a[1]"));
        assert!(!pattern_matches(r"a\[1\]", "a1"));
        assert!(pattern_matches(r"a\\b", r"a\b"));
        assert!(pattern_matches(r"[\]]", "]"));
    }

    #[test]
    fn test_escaped_channel_matches_only_itself() {
        for channel in ["chat*", "room[1]", r"odd\name", "what?"] {
            let pattern = format!("app:{}:*", escape_glob(channel));
            assert!(pattern_matches(&pattern, &format!("app:{channel}:id")));
        }
        let pattern = format!("app:{}:*", escape_glob("chat*"));
        assert!(!pattern_matches(&pattern, "app:chatroom:id"));
        let pattern = format!("app:{}:*", escape_glob("room[1]"));
        assert!(!pattern_matches(&pattern, "app:room1:id"));
    }
}
