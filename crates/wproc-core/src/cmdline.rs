//! Shell-like command tokenizer.
//!
//! Splits a command line into argv the way a shell would for the common
//! cases, and flags the constructs it does not handle (redirection, job
//! control, subshells, globs, unterminated quotes). A nonzero flag set
//! tells the caller to hand the whole line to `/bin/sh -c` instead of
//! exec'ing `argv[0]` directly.
//!
//! Single quotes protect double quotes and vice versa; a backslash
//! protects the byte after it; whitespace outside quotes ends an
//! argument.

/// Bitmask of complications found while splitting.
pub type CmdFlags = u32;

/// Output redirection (`|`) outside quotes.
pub const CMD_HAS_REDIR: CmdFlags = 1 << 0;
/// Job control (`&` or `;`) outside quotes.
pub const CMD_HAS_JOBCONTROL: CmdFlags = 1 << 1;
/// Command substitution (backtick) outside quotes.
pub const CMD_HAS_SUBCOMMAND: CmdFlags = 1 << 2;
/// Subshell parenthesis outside quotes.
pub const CMD_HAS_PAREN: CmdFlags = 1 << 3;
/// Glob characters (`*` or `?`) outside quotes.
pub const CMD_HAS_WILDCARD: CmdFlags = 1 << 4;
/// Unbalanced single quote.
pub const CMD_HAS_UBSQ: CmdFlags = 1 << 5;
/// Unbalanced double quote.
pub const CMD_HAS_UBDQ: CmdFlags = 1 << 6;

const NONE: u32 = 0;
const INARG: u32 = 1 << 1;
const INSQ: u32 = 1 << 2;
const INDQ: u32 = 1 << 3;
const SPECIAL: u32 = 1 << 4;

/// Tokenize `cmd` into argv.
///
/// Returns the argument vector and the complication flags. The argv is
/// returned even when flags are set; callers deciding to fall back to
/// the shell simply discard it.
pub fn split(cmd: &str) -> (Vec<String>, CmdFlags) {
    let bytes = cmd.as_bytes();
    let mut argv: Vec<Vec<u8>> = Vec::new();
    let mut state = NONE;
    let mut flags: CmdFlags = 0;

    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        let in_quotes = state & (INSQ | INDQ) != 0;

        match c {
            b' ' | b'\t' | b'\r' | b'\n' => {
                if state == INARG {
                    state = NONE;
                    i += 1;
                    continue;
                }
                if !in_quotes {
                    i += 1;
                    continue;
                }
                // quoted whitespace is copied below
            }
            b'\\' => {
                // protects the next byte; the backslash itself is dropped
                i += 1;
                if i >= bytes.len() {
                    break;
                }
            }
            b'\'' => {
                if state & INDQ == 0 {
                    if state & INSQ != 0 {
                        state &= !INSQ;
                        i += 1;
                        continue;
                    }
                    if state == NONE || state == INARG {
                        if state == NONE {
                            argv.push(Vec::new());
                        }
                        state = INSQ | INARG;
                        i += 1;
                        continue;
                    }
                }
                // inside double quotes: a literal byte
            }
            b'"' => {
                if state & INSQ == 0 {
                    if state & INDQ != 0 {
                        state &= !INDQ;
                        i += 1;
                        continue;
                    }
                    if state == NONE || state == INARG {
                        if state == NONE {
                            argv.push(Vec::new());
                        }
                        state = INDQ | INARG;
                        i += 1;
                        continue;
                    }
                }
            }
            b'|' => {
                if !in_quotes {
                    flags |= CMD_HAS_REDIR;
                }
            }
            b'&' | b';' => {
                if !in_quotes {
                    flags |= CMD_HAS_JOBCONTROL;
                    state = SPECIAL;
                    // "&&" and ";;" stay one token; a fresh operator
                    // closes the argument under construction
                    if i > 0 && bytes[i - 1] != c {
                        argv.push(Vec::new());
                    }
                }
            }
            b'`' => {
                if !in_quotes {
                    flags |= CMD_HAS_SUBCOMMAND;
                }
            }
            b'(' => {
                if !in_quotes {
                    flags |= CMD_HAS_PAREN;
                }
            }
            b'*' | b'?' => {
                if !in_quotes {
                    flags |= CMD_HAS_WILDCARD;
                }
            }
            _ => {}
        }

        if state == NONE {
            state = INARG;
            argv.push(Vec::new());
        }
        if argv.is_empty() {
            argv.push(Vec::new());
        }
        // by default we simply copy the byte
        if let Some(arg) = argv.last_mut() {
            arg.push(bytes[i]);
        }
        i += 1;
    }

    if state & INSQ != 0 {
        flags |= CMD_HAS_UBSQ;
    }
    if state & INDQ != 0 {
        flags |= CMD_HAS_UBDQ;
    }

    let argv = argv
        .into_iter()
        .map(|a| String::from_utf8_lossy(&a).into_owned())
        .collect();
    (argv, flags)
}
