//! `Sec-WebSocket-Extensions` header values.
//!
//! Extensions are negotiated and passed through by name and parameters only. No extension
//! changes the wire format of frames.
//!
//! ```text
//! Sec-WebSocket-Extensions: permessage-deflate; client_max_window_bits, x-custom; mode="fast"
//! ```
use std::{fmt, str::FromStr};

use nom::{
    branch::alt,
    bytes::complete::{take_till, take_while1},
    character::complete::{char, space0},
    combinator::{all_consuming, opt},
    multi::many0,
    sequence::{delimited, preceded},
    IResult, Parser,
};

use crate::{Result, WebSocketError};

/// One extension offer or acceptance: a name followed by optional parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extension {
    name: String,
    params: Vec<(String, Option<String>)>,
}

impl Extension {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
        }
    }

    /// Adds a parameter, `value` being `None` for bare flags.
    pub fn with_param(mut self, name: impl Into<String>, value: Option<&str>) -> Self {
        self.params.push((name.into(), value.map(str::to_owned)));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &[(String, Option<String>)] {
        &self.params
    }

    /// Parses every extension listed in a set of header values.
    pub fn parse_list<'a>(values: impl IntoIterator<Item = &'a str>) -> Result<Vec<Extension>> {
        values
            .into_iter()
            .flat_map(|value| value.split(','))
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(Extension::from_str)
            .collect()
    }
}

fn is_token(c: char) -> bool {
    c.is_ascii_alphanumeric() || "!#$%&'*+-.^_`|~".contains(c)
}

fn quoted(input: &str) -> IResult<&str, &str> {
    delimited(char('"'), take_till(|c: char| c == '"'), char('"')).parse(input)
}

fn param(input: &str) -> IResult<&str, (String, Option<String>)> {
    let (input, name) = take_while1(is_token).parse(input)?;
    let (input, value) = opt(preceded(
        (space0, char('='), space0),
        alt((quoted, take_while1(is_token))),
    ))
    .parse(input)?;
    Ok((input, (name.to_owned(), value.map(str::to_owned))))
}

fn extension(input: &str) -> IResult<&str, Extension> {
    let (input, name) = preceded(space0, take_while1(is_token)).parse(input)?;
    let (input, params) = many0(preceded((space0, char(';'), space0), param)).parse(input)?;
    let (input, _) = space0(input)?;
    Ok((
        input,
        Extension {
            name: name.to_owned(),
            params,
        },
    ))
}

impl FromStr for Extension {
    type Err = WebSocketError;

    fn from_str(s: &str) -> Result<Self> {
        all_consuming(extension)
            .parse(s)
            .map(|(_, extension)| extension)
            .map_err(|_| WebSocketError::InvalidHttp(format!("bad extension {s:?}")))
    }
}

impl fmt::Display for Extension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        for (name, value) in &self.params {
            match value {
                Some(value) if value.chars().all(is_token) => write!(f, "; {name}={value}")?,
                Some(value) => write!(f, "; {name}=\"{value}\"")?,
                None => write!(f, "; {name}")?,
            }
        }
        Ok(())
    }
}
