//! Memory access traces.
//!
//! A trace is a text file with one operation per line. Blank lines and lines starting
//! with `#` are ignored.
//!
//! ```text
//! process PID PAGES
//! translate PID ADDR
//! read PID PAGE SIZE
//! write PID PAGE OFFSET TEXT
//! protect PID PAGE rw|r-|-w|--
//! flush PID
//! release PID
//! reset
//! ```
//!
//! Numbers are decimal, or hexadecimal with a `0x` prefix. `TEXT` is the rest of the
//! line.

use thiserror::Error;
use vmm::{LogicalAddress, Mmu, MmuError, PageNumber, PhysicalMemory, Pid};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Process { pid: Pid, pages: usize },
    Translate { pid: Pid, addr: LogicalAddress },
    Read { pid: Pid, page: PageNumber, size: usize },
    Write {
        pid: Pid,
        page: PageNumber,
        offset: usize,
        text: String,
    },
    Protect {
        pid: Pid,
        page: PageNumber,
        readable: bool,
        writable: bool,
    },
    Flush { pid: Pid },
    Release { pid: Pid },
    Reset,
}

/// An operation and the line it was read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceLine {
    pub line: usize,
    pub op: Op,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("line {line}: {message}")]
pub struct TraceError {
    pub line: usize,
    pub message: String,
}

/// Parses a whole trace.
pub fn parse(source: &str) -> Result<Vec<TraceLine>, TraceError> {
    source
        .lines()
        .enumerate()
        .map(|(index, text)| (index + 1, text.trim()))
        .filter(|(_, text)| !text.is_empty() && !text.starts_with('#'))
        .map(|(line, text)| {
            parse_op(text)
                .map(|op| TraceLine { line, op })
                .map_err(|message| TraceError { line, message })
        })
        .collect()
}

fn parse_op(text: &str) -> Result<Op, String> {
    let mut tokens = Tokens { rest: text };
    let op = match tokens.next("operation")? {
        "process" => Op::Process {
            pid: tokens.pid()?,
            pages: tokens.number("page count")?,
        },
        "translate" => Op::Translate {
            pid: tokens.pid()?,
            addr: LogicalAddress::new(tokens.number("address")?),
        },
        "read" => Op::Read {
            pid: tokens.pid()?,
            page: tokens.page()?,
            size: tokens.number("size")?,
        },
        "write" => {
            let pid = tokens.pid()?;
            let page = tokens.page()?;
            let offset = tokens.number("offset")?;
            let text = tokens.rest();
            if text.is_empty() {
                return Err("missing text".into());
            }
            return Ok(Op::Write {
                pid,
                page,
                offset,
                text: text.to_string(),
            });
        }
        "protect" => {
            let pid = tokens.pid()?;
            let page = tokens.page()?;
            let (readable, writable) = match tokens.next("permissions")? {
                "rw" => (true, true),
                "r-" => (true, false),
                "-w" => (false, true),
                "--" => (false, false),
                other => return Err(format!("invalid permissions `{other}`")),
            };
            Op::Protect {
                pid,
                page,
                readable,
                writable,
            }
        }
        "flush" => Op::Flush { pid: tokens.pid()? },
        "release" => Op::Release { pid: tokens.pid()? },
        "reset" => Op::Reset,
        other => return Err(format!("unknown operation `{other}`")),
    };

    match tokens.rest() {
        "" => Ok(op),
        extra => Err(format!("unexpected `{extra}`")),
    }
}

struct Tokens<'a> {
    rest: &'a str,
}

impl<'a> Tokens<'a> {
    fn next(&mut self, what: &str) -> Result<&'a str, String> {
        let rest = self.rest.trim_start();
        if rest.is_empty() {
            return Err(format!("missing {what}"));
        }
        let (token, rest) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
        self.rest = rest;
        Ok(token)
    }

    fn number(&mut self, what: &str) -> Result<usize, String> {
        let token = self.next(what)?;
        let parsed = match token.strip_prefix("0x") {
            Some(hex) => usize::from_str_radix(hex, 16),
            None => token.parse(),
        };
        parsed.map_err(|err| format!("invalid {what} `{token}`: {err}"))
    }

    fn pid(&mut self) -> Result<Pid, String> {
        self.number("pid").map(Pid::new)
    }

    fn page(&mut self) -> Result<PageNumber, String> {
        self.number("page").map(PageNumber::new)
    }

    fn rest(&self) -> &'a str {
        self.rest.trim()
    }
}

/// Applies one operation and describes its outcome.
pub fn execute<P: PhysicalMemory>(mmu: &Mmu<P>, op: &Op) -> Result<String, MmuError> {
    match *op {
        Op::Process { pid, pages } => {
            mmu.create_process(pid, pages)?;
            Ok(format!("created pid {pid} with {pages} pages"))
        }
        Op::Translate { pid, addr } => {
            let frame = mmu.translate(pid, addr)?;
            Ok(format!("pid {pid} {addr} -> frame {frame}"))
        }
        Op::Read { pid, page, size } => {
            let content = mmu.read_content(pid, page, size)?;
            Ok(format!(
                "pid {pid} page {page}: {:?}",
                String::from_utf8_lossy(&content)
            ))
        }
        Op::Write {
            pid,
            page,
            offset,
            ref text,
        } => {
            mmu.write_content(pid, page, offset, text.as_bytes())?;
            Ok(format!("pid {pid} page {page}+{offset}: wrote {} bytes", text.len()))
        }
        Op::Protect {
            pid,
            page,
            readable,
            writable,
        } => {
            mmu.protect(pid, page, readable, writable)?;
            Ok(format!(
                "pid {pid} page {page}: read {readable}, write {writable}"
            ))
        }
        Op::Flush { pid } => {
            let written = mmu.flush_process(pid)?;
            Ok(format!("flushed pid {pid}: {written} pages written back"))
        }
        Op::Release { pid } => {
            let frames = mmu.release_process(pid)?;
            Ok(format!("released pid {pid}: {frames} frames freed"))
        }
        Op::Reset => {
            let written = mmu.clear_all()?;
            Ok(format!("reset: {written} pages written back"))
        }
    }
}

/// Replays a trace, logging every outcome. Returns the number of failed operations.
pub fn replay<P: PhysicalMemory>(mmu: &Mmu<P>, name: &str, trace: &[TraceLine]) -> usize {
    let mut failures = 0;
    for TraceLine { line, op } in trace {
        match execute(mmu, op) {
            Ok(outcome) => log::info!("{name}:{line}: {outcome}"),
            Err(err) if err.is_fatal_to_process() => {
                failures += 1;
                log::error!("{name}:{line}: {err} (process unusable)");
            }
            Err(err) => {
                failures += 1;
                log::error!("{name}:{line}: {err}");
            }
        }
    }
    failures
}
