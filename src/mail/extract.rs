//! Turns a "Daily Coding Problem" email into a [`ProblemRecord`].

use mailparse::ParsedMail;
use regex::Regex;
use std::sync::OnceLock;

use crate::domain::problem::{ProblemNumber, ProblemRecord, RawEmail};
use crate::mail::decoders::normalize_newlines;

/// Phrase used for the server-side subject search.
pub const SUBJECT_PHRASE: &str = "Daily Coding Problem";

const GREETING: &str = "Good morning! Here's your coding interview problem for today.";
const FOOTER_SEPARATOR: &str =
    "--------------------------------------------------------------------------------";
const NO_CONTENT: &str = "No Content";

fn subject_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"Daily Coding Problem: Problem #\d+ \[.+\]").expect("valid subject regex")
    })
}

fn digits_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\d+").expect("valid digits regex"))
}

/// Parse a problem email. `None` means the message is not a problem email.
pub fn extract(email: &RawEmail) -> Option<ProblemRecord> {
    let problem_number = problem_number(&email.subject)?;
    let body = normalize_body(&body_text(&email.raw));

    Some(ProblemRecord {
        problem_number,
        subject: email.subject.clone(),
        body,
        source_message_id: email.id.clone(),
    })
}

/// The problem number of a matching subject: the first run of digits.
pub fn problem_number(subject: &str) -> Option<ProblemNumber> {
    if !subject_pattern().is_match(subject) {
        return None;
    }
    digits_pattern().find(subject)?.as_str().parse().ok()
}

/// Drop the greeting and everything from the footer separator on.
pub fn normalize_body(text: &str) -> String {
    let text = normalize_newlines(text);
    let text = text.replacen(GREETING, "", 1);
    let text = text.trim();
    let text = match text.find(FOOTER_SEPARATOR) {
        Some(at) => &text[..at],
        None => text,
    };
    text.trim().to_string()
}

/// Decoded text of the message: first text/plain part of a multipart
/// message, or the top-level body of a single-part one. An empty body
/// counts as no content.
fn body_text(raw: &[u8]) -> String {
    let Ok(parsed) = mailparse::parse_mail(raw) else {
        return NO_CONTENT.to_string();
    };

    let text = if parsed.subparts.is_empty() {
        parsed.get_body().ok()
    } else {
        first_plain_part(&parsed)
    };
    text.filter(|t| !t.is_empty())
        .unwrap_or_else(|| NO_CONTENT.to_string())
}

fn first_plain_part(p: &ParsedMail) -> Option<String> {
    if p.subparts.is_empty() {
        if p.ctype.mimetype.eq_ignore_ascii_case("text/plain") {
            return p.get_body().ok();
        }
        return None;
    }
    p.subparts.iter().find_map(first_plain_part)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCENARIO_BODY: &str = "Good morning! Here's your coding interview problem for today.\nSolve X.\n--------------------------------------------------------------------------------\nfooter";

    fn single_part(subject: &str, body: &str) -> RawEmail {
        let raw = format!(
            "Subject: {subject}\r\nContent-Type: text/plain; charset=utf-8\r\n\r\n{body}"
        );
        RawEmail {
            id: "1842".to_string(),
            subject: subject.to_string(),
            raw: raw.into_bytes(),
        }
    }

    fn multipart(subject: &str, plain_b64: &str) -> RawEmail {
        let raw = format!(
            "Subject: {subject}\r\n\
             MIME-Version: 1.0\r\n\
             Content-Type: multipart/alternative; boundary=\"b1\"\r\n\
             \r\n\
             --b1\r\n\
             Content-Type: text/html; charset=utf-8\r\n\
             \r\n\
             <p>html version</p>\r\n\
             --b1\r\n\
             Content-Type: text/plain; charset=utf-8\r\n\
             Content-Transfer-Encoding: base64\r\n\
             \r\n\
             {plain_b64}\r\n\
             --b1--\r\n"
        );
        RawEmail {
            id: "77".to_string(),
            subject: subject.to_string(),
            raw: raw.into_bytes(),
        }
    }

    #[test]
    fn extracts_problem_743() {
        let email = single_part("Daily Coding Problem: Problem #743 [Medium]", SCENARIO_BODY);
        let record = extract(&email).expect("record");

        assert_eq!(record.problem_number, 743);
        assert_eq!(record.body, "Solve X.");
        assert_eq!(record.subject, "Daily Coding Problem: Problem #743 [Medium]");
        assert_eq!(record.source_message_id, "1842");
    }

    #[test]
    fn extraction_is_idempotent() {
        let email = single_part("Daily Coding Problem: Problem #12 [Hard]", SCENARIO_BODY);
        assert_eq!(extract(&email), extract(&email));
    }

    #[test]
    fn non_problem_subjects_are_skipped() {
        for subject in [
            "Daily Coding Problem",
            "Daily Coding Problem: Problem #12",
            "Daily Coding Problem: Problem #12 []",
            "Daily Coding Problem: Problem #abc [Easy]",
            "Daily Coding Problem: Solution to #12 [Easy]",
            "daily coding problem: problem #12 [Easy]",
            "Your weekly digest",
            "",
        ] {
            assert_eq!(
                extract(&single_part(subject, "body")),
                None,
                "subject {subject:?} should not match"
            );
        }
    }

    #[test]
    fn oversized_problem_number_is_skipped() {
        assert_eq!(
            problem_number("Daily Coding Problem: Problem #99999999999 [Easy]"),
            None
        );
    }

    #[test]
    fn prefers_plain_part_and_decodes_base64() {
        // "Good morning! Here's your coding interview problem for today.\r\nReverse a list.\r\n"
        let b64 = "R29vZCBtb3JuaW5nISBIZXJlJ3MgeW91ciBjb2RpbmcgaW50ZXJ2aWV3IHByb2JsZW0gZm9yIHRvZGF5Lg0KUmV2ZXJzZSBhIGxpc3QuDQo=";
        let email = multipart("Daily Coding Problem: Problem #5 [Easy]", b64);
        let record = extract(&email).expect("record");
        assert_eq!(record.problem_number, 5);
        assert_eq!(record.body, "Reverse a list.");
    }

    #[test]
    fn multipart_without_plain_text_has_no_content() {
        let raw = "Subject: x\r\n\
                   Content-Type: multipart/alternative; boundary=\"b1\"\r\n\
                   \r\n\
                   --b1\r\n\
                   Content-Type: text/html\r\n\
                   \r\n\
                   <p>only html</p>\r\n\
                   --b1--\r\n";
        let email = RawEmail {
            id: "9".to_string(),
            subject: "Daily Coding Problem: Problem #9 [Easy]".to_string(),
            raw: raw.as_bytes().to_vec(),
        };
        assert_eq!(extract(&email).expect("record").body, "No Content");
    }

    fn single_part_encoded(subject: &str, encoding: &str, body: &str) -> RawEmail {
        let raw = format!(
            "Subject: {subject}\r\n\
             Content-Type: text/plain; charset=utf-8\r\n\
             Content-Transfer-Encoding: {encoding}\r\n\
             \r\n\
             {body}"
        );
        RawEmail {
            id: "31".to_string(),
            subject: subject.to_string(),
            raw: raw.into_bytes(),
        }
    }

    #[test]
    fn empty_single_part_body_has_no_content() {
        let email = single_part("Daily Coding Problem: Problem #3 [Easy]", "");
        let record = extract(&email).expect("record");
        assert_eq!(record.problem_number, 3);
        assert_eq!(record.body, "No Content");
    }

    #[test]
    fn single_part_base64_body_is_decoded() {
        // "Good morning! Here's your coding interview problem for today.\r\nReverse a list.\r\n"
        let b64 = "R29vZCBtb3JuaW5nISBIZXJlJ3MgeW91ciBjb2RpbmcgaW50ZXJ2aWV3IHByb2JsZW0gZm9yIHRvZGF5Lg0KUmV2ZXJzZSBhIGxpc3QuDQo=";
        let email = single_part_encoded("Daily Coding Problem: Problem #6 [Easy]", "base64", b64);
        assert_eq!(extract(&email).expect("record").body, "Reverse a list.");
    }

    #[test]
    fn single_part_quoted_printable_body_is_decoded() {
        let qp = "Given an array, find the sum =3D target.\r\n\
                  Return the pair =E2=80=94 or none.\r\n";
        let email = single_part_encoded(
            "Daily Coding Problem: Problem #7 [Medium]",
            "quoted-printable",
            qp,
        );
        assert_eq!(
            extract(&email).expect("record").body,
            "Given an array, find the sum = target.\nReturn the pair \u{2014} or none."
        );
    }

    #[test]
    fn greeting_is_removed_only_once() {
        let body = format!("{GREETING}\nQuote: \"{GREETING}\"");
        assert_eq!(normalize_body(&body), format!("Quote: \"{GREETING}\""));
    }

    #[test]
    fn body_without_separator_is_only_trimmed() {
        assert_eq!(normalize_body("\r\n  Given a list.\r\nDo it.\r\n\r\n"), "Given a list.\nDo it.");
    }

    #[test]
    fn text_after_separator_never_survives() {
        let body = format!("Part one.\n{FOOTER_SEPARATOR}\nUpgrade to premium\n{FOOTER_SEPARATOR}\nmore");
        let out = normalize_body(&body);
        assert_eq!(out, "Part one.");
        assert!(!out.contains(FOOTER_SEPARATOR));
    }
}
