use std::io;

use console::Term;

/// The answer to a numbered prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    /// Zero-based index into the listed items.
    Chosen(usize),
    Invalid,
}

/// Parses a 1-based choice among `len` items.
pub fn parse_selection(input: &str, len: usize) -> Selection {
    match input.trim().parse::<usize>() {
        Ok(n) if n >= 1 && n <= len => Selection::Chosen(n - 1),
        _ => Selection::Invalid,
    }
}

/// Prints `items` as a numbered list and reads the user's choice.
pub fn select(term: &Term, what: &str, items: &[String]) -> io::Result<Selection> {
    term.write_line(&format!("Available {what}:"))?;
    for (i, item) in items.iter().enumerate() {
        term.write_line(&format!("{}. {item}", i + 1))?;
    }
    term.write_line(&format!("Enter the number of the {what} you want to choose:"))?;

    let input = term.read_line()?;
    Ok(parse_selection(&input, items.len()))
}
