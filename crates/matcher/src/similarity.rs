//! Text normalization and string metrics shared by the field matchers.
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

use crate::types::SimilarityMetric;

/// Fold accents, case and whitespace so `" José  Núñez"` equals `"jose nunez"`.
pub fn normalize(text: &str) -> String {
    let folded: String = text
        .nfkd()
        .filter(|c| !is_combining_mark(*c))
        .collect::<String>()
        .to_lowercase();

    let mut normalized = String::with_capacity(folded.len());
    for segment in folded.split_whitespace() {
        if !normalized.is_empty() {
            normalized.push(' ');
        }
        normalized.push_str(segment);
    }
    normalized
}

/// Similarity of two normalized strings in `[0.0, 1.0]`.
pub fn similarity(metric: SimilarityMetric, left: &str, right: &str) -> f64 {
    let left = normalize(left);
    let right = normalize(right);
    let score = match metric {
        SimilarityMetric::JaroWinkler => strsim::jaro_winkler(&left, &right),
        SimilarityMetric::Jaro => strsim::jaro(&left, &right),
        SimilarityMetric::Levenshtein => strsim::normalized_levenshtein(&left, &right),
        SimilarityMetric::DamerauLevenshtein => {
            strsim::normalized_damerau_levenshtein(&left, &right)
        }
        SimilarityMetric::SorensenDice => strsim::sorensen_dice(&left, &right),
    };
    score.clamp(0.0, 1.0)
}

/// Digits only, used by the numeric matcher.
pub fn digits(text: &str) -> String {
    text.chars().filter(char::is_ascii_digit).collect()
}

/// American Soundex code (letter + three digits), `None` when the input has
/// no ASCII letters.
pub fn soundex(text: &str) -> Option<String> {
    let letters: Vec<char> = normalize(text)
        .chars()
        .filter(char::is_ascii_alphabetic)
        .map(|c| c.to_ascii_uppercase())
        .collect();
    let first = *letters.first()?;

    let mut code = String::with_capacity(4);
    code.push(first);
    let mut previous = soundex_digit(first);
    for &letter in &letters[1..] {
        let digit = soundex_digit(letter);
        match digit {
            Some(d) if previous != Some(d) => {
                code.push(d);
                if code.len() == 4 {
                    break;
                }
            }
            _ => {}
        }
        // H and W do not separate letters with the same code; vowels do.
        if !matches!(letter, 'H' | 'W') {
            previous = digit;
        }
    }
    while code.len() < 4 {
        code.push('0');
    }
    Some(code)
}

fn soundex_digit(letter: char) -> Option<char> {
    match letter {
        'B' | 'F' | 'P' | 'V' => Some('1'),
        'C' | 'G' | 'J' | 'K' | 'Q' | 'S' | 'X' | 'Z' => Some('2'),
        'D' | 'T' => Some('3'),
        'L' => Some('4'),
        'M' | 'N' => Some('5'),
        'R' => Some('6'),
        _ => None,
    }
}

/// Split a date or dateTime into its `YYYY`, `MM`, `DD` components.
pub fn date_parts(text: &str) -> Vec<&str> {
    let date = text.trim().split('T').next().unwrap_or_default();
    date.split('-').filter(|part| !part.is_empty()).take(3).collect()
}
