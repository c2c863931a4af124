//! The transaction descriptor table.
//!
//! Commands are grouped into transactions whose members must arrive in
//! declaration order; immediate transactions may be started at any time
//! and abort whatever else is in progress. The table is scanned in
//! declaration order and the first matching verb wins.

//------------ Verb ---------------------------------------------------------

/// The protocol verbs the engine understands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verb {
    Helo,
    Ehlo,
    Mail,
    Rcpt,
    Data,
    Rset,
    Quit,
}


//------------ Descriptors --------------------------------------------------

/// One command inside a transaction.
#[derive(Debug)]
pub struct CommandDesc {
    pub name: &'static str,
    pub verb: Verb,
}

/// An ordered command sequence.
#[derive(Debug)]
pub struct TransactionDesc {
    pub name: &'static str,
    pub commands: &'static [CommandDesc],
    pub immediate: bool,
}

impl TransactionDesc {
    /// Whether the command at `idx` is the transaction's final one.
    pub fn is_last(&self, idx: usize) -> bool {
        idx + 1 == self.commands.len()
    }
}

/// All transactions, in declaration order.
pub static TRANSACTIONS: &[TransactionDesc] = &[
    TransactionDesc {
        name: "helo",
        commands: &[CommandDesc { name: "HELO", verb: Verb::Helo }],
        immediate: false,
    },
    TransactionDesc {
        name: "ehlo",
        commands: &[CommandDesc { name: "EHLO", verb: Verb::Ehlo }],
        immediate: false,
    },
    TransactionDesc {
        name: "mail",
        commands: &[
            CommandDesc { name: "MAIL", verb: Verb::Mail },
            CommandDesc { name: "RCPT", verb: Verb::Rcpt },
            CommandDesc { name: "DATA", verb: Verb::Data },
        ],
        immediate: false,
    },
    TransactionDesc {
        name: "rset",
        commands: &[CommandDesc { name: "RSET", verb: Verb::Rset }],
        immediate: true,
    },
    TransactionDesc {
        name: "quit",
        commands: &[CommandDesc { name: "QUIT", verb: Verb::Quit }],
        immediate: true,
    },
];


//------------ Lookup -------------------------------------------------------

/// Position of a command in the table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Match {
    pub txn: usize,
    pub cmd: usize,
}

impl Match {
    pub fn transaction(&self) -> &'static TransactionDesc {
        &TRANSACTIONS[self.txn]
    }

    pub fn verb(&self) -> Verb {
        TRANSACTIONS[self.txn].commands[self.cmd].verb
    }
}

/// Finds a command by its verb, case-insensitively, first match wins.
pub fn lookup(word: &str) -> Option<Match> {
    for (t, txn) in TRANSACTIONS.iter().enumerate() {
        for (c, cmd) in txn.commands.iter().enumerate() {
            if word.eq_ignore_ascii_case(cmd.name) {
                return Some(Match { txn: t, cmd: c });
            }
        }
    }
    None
}

/// Splits a command frame into the verb and the argument rest.
///
/// Returns the verb, and the offset at which the argument starts in the
/// frame (past the single separating space, when present).
pub fn split_verb(frame: &[u8]) -> (&[u8], usize) {
    match frame.iter().position(|&b| b == b' ') {
        Some(pos) => (&frame[..pos], pos + 1),
        None => (frame, frame.len()),
    }
}
