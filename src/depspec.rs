//! Token grammar shared by `LICENSE` and `SRC_URI`.
//!
//! Both values are whitespace-separated tokens where `(`, `)`, `||` and
//! `flag?` are tokens of their own.
//!
//! See [PMS 8.2](https://projects.gentoo.org/pms/9/pms.html#dependency-specification-format).

use winnow::ascii::multispace0;
use winnow::combinator::{cut_err, delimited, preceded};
use winnow::error::{ContextError, ErrMode, StrContext};
use winnow::prelude::*;
use winnow::token::take_till;

use crate::iuse::is_valid_flag_name;

/// The next whitespace-delimited token.
pub(crate) fn word<'s>(input: &mut &'s str) -> ModalResult<&'s str> {
    preceded(multispace0, take_till(1.., char::is_whitespace)).parse_next(input)
}

/// The next token, if it is exactly `expected`.
pub(crate) fn exactly<'s>(
    expected: &'static str,
) -> impl Parser<&'s str, &'s str, ErrMode<ContextError>> {
    word.verify(move |w: &str| w == expected)
}

/// Stops a `repeat` at a closing parenthesis without consuming it.
pub(crate) fn end_of_group<T>() -> ModalResult<T> {
    Err(ErrMode::Backtrack(ContextError::new()))
}

/// `( entries )`, where a missing `)` is fatal.
pub(crate) fn parenthesized<'s, T, P>(
    entries: P,
) -> impl Parser<&'s str, Vec<T>, ErrMode<ContextError>>
where
    P: Parser<&'s str, Vec<T>, ErrMode<ContextError>>,
{
    delimited(
        exactly("("),
        entries,
        cut_err(exactly(")")).context(StrContext::Label("closing ')'")),
    )
}

/// `[!]flag? ( entries )` as `(flag, negated, entries)`.
pub(crate) fn use_conditional<'s, T, P>(
    entries: P,
) -> impl Parser<&'s str, (String, bool, Vec<T>), ErrMode<ContextError>>
where
    P: Parser<&'s str, Vec<T>, ErrMode<ContextError>>,
{
    (
        cut_err(word.verify_map(use_test)).context(StrContext::Label("USE flag")),
        cut_err(parenthesized(entries)).context(StrContext::Label("'(' after USE conditional")),
    )
        .map(|((flag, negated), entries)| (flag, negated, entries))
}

fn use_test(word: &str) -> Option<(String, bool)> {
    let test = word.strip_suffix('?')?;
    let (flag, negated) = match test.strip_prefix('!') {
        Some(flag) => (flag, true),
        None => (test, false),
    };
    is_valid_flag_name(flag).then(|| (flag.to_string(), negated))
}
