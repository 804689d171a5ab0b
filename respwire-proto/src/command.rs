//! # Commands
//!
//! Purpose: Represent one request as the ordered list of byte strings that
//! will be framed as a RESP array of bulk strings.

use std::fmt;

use bytes::Bytes;

/// A command name plus its arguments.
///
/// Built once with [`Command::new`] / [`Command::arg`] and then only read.
/// Arguments are opaque bytes; nothing here assumes UTF-8.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Command {
    args: Vec<Bytes>,
}

impl Command {
    /// Starts a command with its name as the first element.
    pub fn new(name: impl AsRef<[u8]>) -> Self {
        Command {
            args: vec![Bytes::copy_from_slice(name.as_ref())],
        }
    }

    /// Appends one argument.
    pub fn arg(mut self, arg: impl AsRef<[u8]>) -> Self {
        self.args.push(Bytes::copy_from_slice(arg.as_ref()));
        self
    }

    /// Appends every item of `args` in order.
    pub fn args_from<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: AsRef<[u8]>,
    {
        self.args
            .extend(args.into_iter().map(|a| Bytes::copy_from_slice(a.as_ref())));
        self
    }

    /// Builds a command from a full argument list (name first).
    pub fn from_args<I, A>(args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: AsRef<[u8]>,
    {
        Command { args: Vec::new() }.args_from(args)
    }

    /// The command name, or an empty slice for an empty command.
    pub fn name(&self) -> &[u8] {
        self.args.first().map(|b| b.as_ref()).unwrap_or(&[])
    }

    /// All elements, name included.
    pub fn args(&self) -> &[Bytes] {
        &self.args
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    /// Case-insensitive comparison of the command name.
    pub fn is_named(&self, name: &[u8]) -> bool {
        self.name().eq_ignore_ascii_case(name)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, arg) in self.args.iter().enumerate() {
            if idx > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{}", String::from_utf8_lossy(arg))?;
        }
        Ok(())
    }
}
