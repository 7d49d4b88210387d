use thiserror::Error;
use winnow::{
    ModalResult, Parser,
    ascii::{digit1, multispace1},
    combinator::{alt, preceded},
    error::StrContext,
    token::take_while,
};

/// The routing decision for one request: connect directly, or relay
/// through the named upstream proxy (`host:port`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDirective {
    Direct,
    ViaProxy(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unrecognized route directive `{directive}`")]
pub struct DirectiveError {
    directive: String,
}

fn parse_proxy_address(input: &mut &str) -> ModalResult<String> {
    (
        take_while(1.., |c: char| c != ':' && c != ';' && !c.is_whitespace()),
        ':',
        digit1,
    )
        .take()
        .map(str::to_string)
        .parse_next(input)
}

fn parse_entry(input: &mut &str) -> ModalResult<RouteDirective> {
    alt((
        "DIRECT".map(|_| RouteDirective::Direct),
        preceded(
            ("PROXY", multispace1),
            parse_proxy_address.context(StrContext::Label("proxy address")),
        )
        .map(RouteDirective::ViaProxy),
    ))
    .parse_next(input)
}

/// Parse a PAC result string into a [`RouteDirective`].
///
/// The grammar is the literal `DIRECT` or `PROXY <host>:<port>`. Only the
/// first `;`-separated entry is considered; fallback lists and `SOCKS`
/// entries are unsupported.
pub fn parse_directive(raw: &str) -> Result<RouteDirective, DirectiveError> {
    let first = raw.split(';').next().unwrap_or(raw).trim();
    parse_entry.parse(first).map_err(|_| DirectiveError {
        directive: first.to_string(),
    })
}
