//! Argument grammars for the commands that take one.

use nom::branch::alt;
use nom::bytes::complete::{tag, tag_no_case, take_while1};
use nom::character::complete::space0;
use nom::combinator::{all_consuming, opt, recognize, verify};
use nom::sequence::{delimited, preceded, separated_pair, terminated};
use nom::IResult;

/// A domain as a client may declare it: alphanumerics and dots.
fn plain_domain(i: &str) -> IResult<&str, &str> {
    verify(
        take_while1(|c: char| c.is_ascii_alphanumeric() || c == '.'),
        |s: &str| !s.starts_with('.') && !s.ends_with('.'),
    )(i)
}

/// The domain part of an address additionally allows hyphens.
fn address_domain(i: &str) -> IResult<&str, &str> {
    verify(
        take_while1(|c: char| {
            c.is_ascii_alphanumeric() || c == '.' || c == '-'
        }),
        |s: &str| !s.starts_with('.') && !s.ends_with('.'),
    )(i)
}

fn local_part(i: &str) -> IResult<&str, &str> {
    take_while1(|c: char| {
        c.is_ascii_graphic() && !matches!(c, '@' | '<' | '>' | '"' | ',')
    })(i)
}

fn mailbox(i: &str) -> IResult<&str, &str> {
    recognize(separated_pair(local_part, tag("@"), address_domain))(i)
}

/// Validates a HELO/EHLO argument, returning the declared domain.
pub fn helo_domain(arg: &str) -> Option<&str> {
    all_consuming(delimited(space0, plain_domain, space0))(arg)
        .ok()
        .map(|(_, domain)| domain)
}

/// Parses a `FROM:<address>` argument.
///
/// The empty angle pair is the null sender and yields an empty string.
pub fn mail_from(arg: &str) -> Option<&str> {
    let path = delimited(tag("<"), opt(mailbox), tag(">"));
    all_consuming(terminated(
        preceded(
            preceded(space0, tag_no_case("FROM:")),
            preceded(space0, path),
        ),
        space0,
    ))(arg)
    .ok()
    .map(|(_, addr)| addr.unwrap_or(""))
}

/// Parses a `TO:<address>` argument; the address is mandatory here.
pub fn rcpt_to(arg: &str) -> Option<&str> {
    let path = delimited(tag("<"), mailbox, tag(">"));
    let bare = mailbox;
    all_consuming(terminated(
        preceded(
            preceded(space0, tag_no_case("TO:")),
            preceded(space0, alt((path, bare))),
        ),
        space0,
    ))(arg)
    .ok()
    .map(|(_, addr)| addr)
}

/// Splits an address into local part and domain.
pub fn address_parts(address: &str) -> Option<(&str, &str)> {
    all_consuming(separated_pair(local_part, tag("@"), address_domain))(
        address,
    )
    .ok()
    .map(|(_, parts)| parts)
}


#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn helo_accepts_plain_domains() {
        assert_eq!(helo_domain("example.com"), Some("example.com"));
        assert_eq!(helo_domain("  mx1.example.com "), Some("mx1.example.com"));
        assert_eq!(helo_domain("localhost"), Some("localhost"));
    }

    #[test]
    fn helo_rejects_junk() {
        assert_eq!(helo_domain(""), None);
        assert_eq!(helo_domain("exa mple.com"), None);
        assert_eq!(helo_domain("[127.0.0.1]"), None);
        assert_eq!(helo_domain(".example.com"), None);
        assert_eq!(helo_domain("example.com."), None);
    }

    #[test]
    fn mail_from_paths() {
        assert_eq!(mail_from("FROM:<a@b.com>"), Some("a@b.com"));
        assert_eq!(mail_from("from:<a@b.com>"), Some("a@b.com"));
        assert_eq!(mail_from("FROM: <a@b.com>"), Some("a@b.com"));
        // The null sender is legal.
        assert_eq!(mail_from("FROM:<>"), Some(""));
        assert_eq!(mail_from("FROM:a@b.com"), None);
        assert_eq!(mail_from("TO:<a@b.com>"), None);
        assert_eq!(mail_from(""), None);
    }

    #[test]
    fn rcpt_to_paths() {
        assert_eq!(rcpt_to("TO:<c@d.org>"), Some("c@d.org"));
        assert_eq!(rcpt_to("to: <c@d.org>"), Some("c@d.org"));
        assert_eq!(rcpt_to("TO:c@d.org"), Some("c@d.org"));
        // No null recipient.
        assert_eq!(rcpt_to("TO:<>"), None);
        assert_eq!(rcpt_to("FROM:<c@d.org>"), None);
    }

    #[test]
    fn address_split() {
        assert_eq!(address_parts("user@example.com"),
                   Some(("user", "example.com")));
        assert_eq!(address_parts("no-at-sign"), None);
    }
}
