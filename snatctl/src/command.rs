// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Parsing of control commands
//!
//! Supported commands:
//!
//! ```text
//! snat add address <addr> [- <addr>]
//! snat add static mapping local <addr> [<port>] external <addr> [<port>] [vrf <id>] [del]
//! show snat [detail|verbose]
//! show snat config
//! snat in2out <proto> <addr> <port> [fib <index>] [len <bytes>]
//! snat out2in <proto> <addr> <port> [fib <index>] [len <bytes>]
//! snat expire <seconds>
//! ```

use nat::{
    FibIndex, NatDirection, NatError, NatProtocol, ShowLevel, StaticMappingRequest,
    TranslationKey,
};
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub(crate) enum CommandError {
    #[error("unknown input: '{0}'")]
    UnknownInput(String),
    #[error("missing {0}")]
    Missing(&'static str),
    #[error("invalid {what}: '{value}'")]
    InvalidValue { what: &'static str, value: String },
    #[error("External port already in use.")]
    PortInUse,
    #[error("External address must be allocated.")]
    ExternalNotAllocated,
    #[error(transparent)]
    Nat(#[from] NatError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Command {
    AddAddress {
        first: Ipv4Addr,
        last: Ipv4Addr,
    },
    StaticMapping {
        request: StaticMappingRequest,
        is_add: bool,
    },
    Show(ShowLevel),
    ShowConfig,
    Translate {
        direction: NatDirection,
        key: TranslationKey,
        len: usize,
    },
    Expire(Duration),
}

// Consumes tokens of one command line
struct Tokens<'a> {
    tokens: Vec<&'a str>,
    pos: usize,
}

impl<'a> Tokens<'a> {
    fn new(line: &'a str) -> Self {
        Self {
            tokens: line.split_whitespace().collect(),
            pos: 0,
        }
    }

    fn peek(&self) -> Option<&'a str> {
        self.tokens.get(self.pos).copied()
    }

    fn next_token(&mut self) -> Option<&'a str> {
        let token = self.peek()?;
        self.pos += 1;
        Some(token)
    }

    fn eat(&mut self, words: &[&str]) -> bool {
        if self.tokens[self.pos..].starts_with(words) {
            self.pos += words.len();
            true
        } else {
            false
        }
    }

    fn rest(&self) -> String {
        self.tokens[self.pos..].join(" ")
    }

    fn parse<T: FromStr>(&mut self, what: &'static str) -> Result<T, CommandError> {
        let token = self.next_token().ok_or(CommandError::Missing(what))?;
        token.parse().map_err(|_| CommandError::InvalidValue {
            what,
            value: token.to_string(),
        })
    }

    // Parse the next token if it is a valid `T`, leave it alone otherwise
    fn parse_optional<T: FromStr>(&mut self) -> Option<T> {
        let value = self.peek()?.parse().ok()?;
        self.pos += 1;
        Some(value)
    }

    fn end(&self) -> Result<(), CommandError> {
        if self.pos < self.tokens.len() {
            Err(CommandError::UnknownInput(self.rest()))
        } else {
            Ok(())
        }
    }
}

fn parse_add_address(tokens: &mut Tokens) -> Result<Command, CommandError> {
    let first = tokens.parse("address")?;
    let last = if tokens.eat(&["-"]) {
        tokens.parse("address")?
    } else {
        first
    };
    tokens.end()?;
    Ok(Command::AddAddress { first, last })
}

fn parse_static_mapping(tokens: &mut Tokens) -> Result<Command, CommandError> {
    let mut local: Option<(Ipv4Addr, Option<u16>)> = None;
    let mut external: Option<(Ipv4Addr, Option<u16>)> = None;
    let mut vrf_id = None;
    let mut is_add = true;
    while tokens.peek().is_some() {
        if tokens.eat(&["local"]) {
            local = Some((tokens.parse("local address")?, tokens.parse_optional()));
        } else if tokens.eat(&["external"]) {
            external = Some((tokens.parse("external address")?, tokens.parse_optional()));
        } else if tokens.eat(&["vrf"]) {
            vrf_id = Some(tokens.parse("vrf id")?);
        } else if tokens.eat(&["del"]) {
            is_add = false;
        } else {
            return Err(CommandError::UnknownInput(tokens.rest()));
        }
    }
    let (local_addr, local_port) = local.ok_or(CommandError::Missing("local address"))?;
    let (external_addr, external_port) =
        external.ok_or(CommandError::Missing("external address"))?;
    let mut request = if local_port.is_none() && external_port.is_none() {
        StaticMappingRequest::address_only(local_addr, external_addr)
    } else {
        StaticMappingRequest::with_ports(
            local_addr,
            local_port.unwrap_or(0),
            external_addr,
            external_port.unwrap_or(0),
        )
    };
    request.vrf_id = vrf_id;
    Ok(Command::StaticMapping { request, is_add })
}

fn parse_show(tokens: &mut Tokens) -> Result<Command, CommandError> {
    let command = if tokens.eat(&["config"]) {
        Command::ShowConfig
    } else if tokens.eat(&["detail"]) {
        Command::Show(ShowLevel::Detail)
    } else if tokens.eat(&["verbose"]) {
        Command::Show(ShowLevel::Verbose)
    } else {
        Command::Show(ShowLevel::Summary)
    };
    tokens.end()?;
    Ok(command)
}

fn parse_translate(tokens: &mut Tokens, direction: NatDirection) -> Result<Command, CommandError> {
    let protocol: NatProtocol = tokens.parse("protocol")?;
    let addr = tokens.parse("address")?;
    let port = tokens.parse("port")?;
    let mut fib_index = FibIndex::default();
    let mut len = 0;
    while tokens.peek().is_some() {
        if tokens.eat(&["fib"]) {
            let index: u32 = tokens.parse("fib index")?;
            fib_index = FibIndex::new_checked(index).map_err(|_| CommandError::InvalidValue {
                what: "fib index",
                value: index.to_string(),
            })?;
        } else if tokens.eat(&["len"]) {
            len = tokens.parse("length")?;
        } else {
            return Err(CommandError::UnknownInput(tokens.rest()));
        }
    }
    Ok(Command::Translate {
        direction,
        key: TranslationKey::new(addr, port, protocol, fib_index),
        len,
    })
}

impl FromStr for Command {
    type Err = CommandError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut tokens = Tokens::new(line);
        if tokens.eat(&["snat", "add", "address"]) {
            parse_add_address(&mut tokens)
        } else if tokens.eat(&["snat", "add", "static", "mapping"]) {
            parse_static_mapping(&mut tokens)
        } else if tokens.eat(&["show", "snat"]) {
            parse_show(&mut tokens)
        } else if tokens.eat(&["snat", "in2out"]) {
            parse_translate(&mut tokens, NatDirection::In2Out)
        } else if tokens.eat(&["snat", "out2in"]) {
            parse_translate(&mut tokens, NatDirection::Out2In)
        } else if tokens.eat(&["snat", "expire"]) {
            let seconds = tokens.parse("timeout")?;
            tokens.end()?;
            Ok(Command::Expire(Duration::from_secs(seconds)))
        } else {
            Err(CommandError::UnknownInput(tokens.rest()))
        }
    }
}
