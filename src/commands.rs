//! Console commands and their matching rules.

use resync::HostSignal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
  Signal(HostSignal),
  Refresh,
  Status,
  Help,
  Quit,
}

#[derive(Debug, Clone)]
pub struct Command {
  pub name: &'static str,
  pub aliases: &'static [&'static str],
  pub description: &'static str,
  pub action: Action,
}

pub const COMMANDS: &[Command] = &[
  Command {
    name: "online",
    aliases: &["up"],
    description: "Report that the network came back",
    action: Action::Signal(HostSignal::Online),
  },
  Command {
    name: "offline",
    aliases: &["down"],
    description: "Report that the network is gone",
    action: Action::Signal(HostSignal::Offline),
  },
  Command {
    name: "visible",
    aliases: &["show", "focus"],
    description: "The host became visible again",
    action: Action::Signal(HostSignal::Visible),
  },
  Command {
    name: "hidden",
    aliases: &["hide", "blur"],
    description: "The host was hidden or suspended",
    action: Action::Signal(HostSignal::Hidden),
  },
  Command {
    name: "check",
    aliases: &["c", "ping"],
    description: "Check the connection now",
    action: Action::Signal(HostSignal::CheckNow),
  },
  Command {
    name: "refresh",
    aliases: &["r", "reload"],
    description: "Force a refresh of one resource, or all of them",
    action: Action::Refresh,
  },
  Command {
    name: "status",
    aliases: &["s", "st"],
    description: "Show connection state and resource snapshots",
    action: Action::Status,
  },
  Command {
    name: "help",
    aliases: &["h", "?"],
    description: "List commands",
    action: Action::Help,
  },
  Command {
    name: "quit",
    aliases: &["q", "exit"],
    description: "Dispose the context and exit",
    action: Action::Quit,
  },
];

/// A parsed console line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Input {
  pub action: Action,
  pub argument: Option<String>,
}

/// Lower is better; `None` means no match
fn rank(cmd: &Command, input: &str) -> Option<u32> {
  let aliases = || cmd.aliases.iter();
  if cmd.name == input {
    Some(0)
  } else if aliases().any(|a| *a == input) {
    Some(1)
  } else if cmd.name.starts_with(input) {
    Some(2)
  } else if aliases().any(|a| a.starts_with(input)) {
    Some(3)
  } else if cmd.name.contains(input) {
    Some(4)
  } else if aliases().any(|a| a.contains(input)) {
    Some(5)
  } else {
    None
  }
}

/// Commands matching `input`, best match first
pub fn get_suggestions(input: &str) -> Vec<&'static Command> {
  let input = input.trim().to_lowercase();
  if input.is_empty() {
    return COMMANDS.iter().collect();
  }

  let mut ranked: Vec<(&'static Command, u32)> = COMMANDS
    .iter()
    .filter_map(|cmd| rank(cmd, &input).map(|r| (cmd, r)))
    .collect();
  ranked.sort_by_key(|(_, r)| *r);
  ranked.into_iter().map(|(cmd, _)| cmd).collect()
}

/// Resolve a console line to the best matching command and its argument
pub fn parse(line: &str) -> Option<Input> {
  let mut words = line.split_whitespace();
  let word = words.next()?;
  let cmd = get_suggestions(word).into_iter().next()?;
  let rest: Vec<&str> = words.collect();
  Some(Input {
    action: cmd.action,
    argument: (!rest.is_empty()).then(|| rest.join(" ")),
  })
}

pub fn help_text() -> String {
  COMMANDS
    .iter()
    .map(|cmd| format!("  {:<8} {:<14} {}", cmd.name, cmd.aliases.join(","), cmd.description))
    .collect::<Vec<_>>()
    .join("\n")
}
