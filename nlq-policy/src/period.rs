//! Reporting-period extraction: question text → `YYYY-MM`.

use std::sync::OnceLock;

use regex::Regex;

/// (stem, month). Russian stems cover every case form ("октябрь", "октября", "октябре").
const RU_STEMS: [(&str, u32); 11] = [
    ("январ", 1),
    ("феврал", 2),
    ("март", 3),
    ("апрел", 4),
    ("июн", 6),
    ("июл", 7),
    ("август", 8),
    ("сентябр", 9),
    ("октябр", 10),
    ("ноябр", 11),
    ("декабр", 12),
];

const RU_MAY: [&str; 4] = ["май", "мая", "мае", "маем"];

const EN_MONTHS: [(&str, &str, u32); 12] = [
    ("january", "jan", 1),
    ("february", "feb", 2),
    ("march", "mar", 3),
    ("april", "apr", 4),
    ("may", "may", 5),
    ("june", "jun", 6),
    ("july", "jul", 7),
    ("august", "aug", 8),
    ("september", "sep", 9),
    ("october", "oct", 10),
    ("november", "nov", 11),
    ("december", "dec", 12),
];

fn iso_period() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b(20\d{2})-(0[1-9]|1[0-2])\b").expect("static regex"))
}

fn dotted_period() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b(0?[1-9]|1[0-2])[./](20\d{2})\b").expect("static regex"))
}

/// Words after which English "may" reads as the month rather than the modal.
const EN_MAY_LEADS: [&str; 8] = ["in", "for", "of", "during", "since", "until", "by", "through"];

fn words(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect()
}

fn as_year(word: &str) -> Option<i32> {
    if word.len() == 4 && word.starts_with("20") && word.bytes().all(|b| b.is_ascii_digit()) {
        word.parse().ok()
    } else {
        None
    }
}

/// Month named by a single word. English "may" is reported as ambiguous.
fn month_word(word: &str) -> Option<(u32, bool)> {
    if RU_MAY.contains(&word) {
        return Some((5, false));
    }
    if let Some((_, m)) = RU_STEMS.iter().find(|(stem, _)| word.starts_with(stem)) {
        return Some((*m, false));
    }
    EN_MONTHS
        .iter()
        .find(|(full, short, _)| word == *full || word == *short || (*short == "sep" && word == "sept"))
        .map(|(_, _, m)| (*m, word == "may"))
}

/// Position and number of the month mention. Unambiguous names win over
/// English "may", which only counts after a preposition or before a year.
fn month_mention(words: &[String]) -> Option<(usize, u32)> {
    let mut fallback = None;
    for (i, word) in words.iter().enumerate() {
        let Some((month, ambiguous)) = month_word(word) else {
            continue;
        };
        if !ambiguous {
            return Some((i, month));
        }
        let led = i > 0 && EN_MAY_LEADS.contains(&words[i - 1].as_str());
        let dated = words.get(i + 1).and_then(|w| as_year(w)).is_some();
        if fallback.is_none() && (led || dated) {
            fallback = Some((i, month));
        }
    }
    fallback
}

/// Year attached to the month at `at`: right after it, right before it, or
/// any "20xx года" / "20xx г" form.
fn year_for(words: &[String], at: usize) -> Option<i32> {
    if let Some(y) = words.get(at + 1).and_then(|w| as_year(w)) {
        return Some(y);
    }
    if let Some(y) = at.checked_sub(1).and_then(|i| as_year(&words[i])) {
        return Some(y);
    }
    words.windows(2).find_map(|pair| {
        let tail = pair[1].as_str();
        if tail == "г" || tail.starts_with("год") {
            as_year(&pair[0])
        } else {
            None
        }
    })
}

/// Month number named anywhere in the text.
pub fn month_in(text: &str) -> Option<u32> {
    month_mention(&words(text)).map(|(_, m)| m)
}

/// Extract a `YYYY-MM` period. Explicit `YYYY-MM` / `MM.YYYY` forms win; a
/// month name takes the year written next to it, else `default_year`.
pub fn extract_period(question: &str, default_year: i32) -> Option<String> {
    if let Some(caps) = iso_period().captures(question) {
        return Some(format!("{}-{}", &caps[1], &caps[2]));
    }
    if let Some(caps) = dotted_period().captures(question) {
        let month: u32 = caps[1].parse().ok()?;
        return Some(format!("{}-{:02}", &caps[2], month));
    }
    let words = words(question);
    let (at, month) = month_mention(&words)?;
    let year = year_for(&words, at).unwrap_or(default_year);
    Some(format!("{year:04}-{month:02}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn russian_month_with_default_year() {
        assert_eq!(extract_period("Найди убыточных клиентов за октябрь", 2025).as_deref(), Some("2025-10"));
        assert_eq!(extract_period("выручка в мае", 2024).as_deref(), Some("2024-05"));
        assert_eq!(extract_period("данные за марта 2023 года", 2025).as_deref(), Some("2023-03"));
    }

    #[test]
    fn english_and_numeric_forms() {
        assert_eq!(extract_period("losses for Sept 2024", 2025).as_deref(), Some("2024-09"));
        assert_eq!(extract_period("period 2025-02 only", 2020).as_deref(), Some("2025-02"));
        assert_eq!(extract_period("за 7.2025", 2020).as_deref(), Some("2025-07"));
    }

    #[test]
    fn margin_is_not_march() {
        assert_eq!(extract_period("low margin customers", 2025), None);
        assert_eq!(extract_period("клиенты с низкой маржой", 2025), None);
    }

    #[test]
    fn modal_may_is_not_a_month() {
        assert_eq!(
            extract_period("Which customers may be unprofitable in October?", 2025).as_deref(),
            Some("2025-10")
        );
        assert_eq!(extract_period("revenue in May", 2025).as_deref(), Some("2025-05"));
        assert_eq!(extract_period("May 2024 losses", 2025).as_deref(), Some("2024-05"));
        assert_eq!(extract_period("what may change", 2025), None);
    }

    #[test]
    fn stray_numbers_are_not_years() {
        assert_eq!(
            extract_period("top 2000 убыточных клиентов за октябрь", 2025).as_deref(),
            Some("2025-10")
        );
        assert_eq!(extract_period("в 2024 году за октябрь", 2025).as_deref(), Some("2024-10"));
    }
}
