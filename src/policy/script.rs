use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::{Method, Request, Uri, header};
use hyper_util::rt::TokioIo;
use thiserror::Error;
use tokio::net::TcpStream;
use tracing::debug;
use winnow::{
    ModalResult, Parser,
    ascii::{multispace0, multispace1},
    combinator::{alt, delimited, opt},
    error::{ContextError, ParseError, StrContext},
    token::take_while,
};

use crate::policy::{
    PolicyError, PolicyResolver,
    directive::{DirectiveError, RouteDirective, parse_directive},
};

/// A resolver built from a PAC script whose body is a single constant
/// `return` statement. That is the shape a fetched constant PAC has, and
/// the shape [`hardcoded_proxy_script`] generates. Scripts with any actual
/// logic are rejected at construction; evaluating those belongs to an
/// external PAC engine implementing [`PolicyResolver`].
pub struct ConstantScriptResolver {
    directive: RouteDirective,
}

#[derive(Debug)]
pub struct ScriptParseError {
    message: String,
    span: std::ops::Range<usize>,
    input: String,
}

impl ScriptParseError {
    fn from_parse(error: ParseError<&str, ContextError>) -> Self {
        Self {
            message: error.inner().to_string(),
            input: (*error.input()).to_owned(),
            span: error.char_span(),
        }
    }
}

impl std::fmt::Display for ScriptParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let message = annotate_snippets::Level::ERROR
            .primary_title(&self.message)
            .element(
                annotate_snippets::Snippet::source(&self.input)
                    .fold(true)
                    .annotation(annotate_snippets::AnnotationKind::Primary.span(self.span.clone())),
            );
        let renderer = annotate_snippets::Renderer::plain();
        let rendered = renderer.render(&[message]);
        write!(f, "{rendered}")
    }
}

impl std::error::Error for ScriptParseError {}

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("not a constant PAC script:\n{0}")]
    Parse(ScriptParseError),
    #[error(transparent)]
    Directive(#[from] DirectiveError),
}

fn parse_quoted<'a>(input: &mut &'a str) -> ModalResult<&'a str> {
    alt((
        delimited('"', take_while(0.., |c: char| c != '"'), '"'),
        delimited('\'', take_while(0.., |c: char| c != '\''), '\''),
    ))
    .parse_next(input)
}

fn parse_constant_script<'a>(input: &mut &'a str) -> ModalResult<&'a str> {
    delimited(
        (
            (multispace0, "function", multispace1, "FindProxyForURL"),
            (multispace0, '(', take_while(0.., |c: char| c != ')'), ')'),
            (multispace0, '{', multispace0, "return", multispace1),
        ),
        parse_quoted.context(StrContext::Label("a constant directive string")),
        (multispace0, opt(';'), multispace0, '}', multispace0),
    )
    .parse_next(input)
}

impl ConstantScriptResolver {
    pub fn from_script(script: &str) -> Result<Self, ScriptError> {
        let raw = parse_constant_script
            .parse(script)
            .map_err(|e| ScriptError::Parse(ScriptParseError::from_parse(e)))?;
        let directive = parse_directive(raw)?;
        Ok(Self { directive })
    }
}

impl PolicyResolver for ConstantScriptResolver {
    fn find_proxy(&self, _target: &Uri) -> Result<RouteDirective, PolicyError> {
        Ok(self.directive.clone())
    }
}

/// Wrap a fixed upstream proxy address into the trivial PAC script that
/// always returns it.
pub fn hardcoded_proxy_script(proxy: &str) -> String {
    format!("function FindProxyForURL(url, host) {{ return \"PROXY {proxy}\" }}")
}

/// Fetch a PAC script over a direct, non-proxied connection. Only the
/// `http` scheme is supported; the proxy carries no TLS client.
pub async fn fetch_script(url: &str) -> anyhow::Result<String> {
    let uri: Uri = url
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid PAC URL `{url}`: {e}"))?;
    anyhow::ensure!(
        uri.scheme_str() == Some("http"),
        "PAC URLs must use the http scheme"
    );
    let host = uri
        .host()
        .ok_or_else(|| anyhow::anyhow!("PAC URL `{url}` has no host"))?;
    let port = uri.port_u16().unwrap_or(80);
    let authority = format!("{host}:{port}");

    let stream = TcpStream::connect((host, port)).await?;
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
    tokio::task::spawn(async move {
        if let Err(e) = conn.await {
            debug!("PAC fetch connection error: {e}");
        }
    });

    let path = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
        .to_string();
    let request = Request::builder()
        .method(Method::GET)
        .uri(path)
        .header(header::HOST, authority)
        .body(Empty::<Bytes>::new())?;

    let response = sender.send_request(request).await?;
    anyhow::ensure!(
        response.status().is_success(),
        "PAC fetch failed with status {}",
        response.status()
    );
    let body = response.into_body().collect().await?.to_bytes();
    Ok(String::from_utf8(body.to_vec())?)
}
