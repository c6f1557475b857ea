use familiar_client::{AgentConfig, ChatResponse, ConnectStatus, SkillsResponse, ToolsResponse};

/// One line of REPL input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Status,
    Memory,
    Skills,
    Toggle(String),
    Tools,
    Config,
    Services,
    Restart,
    Stop,
    Reset,
    Quit,
    Help,
    Chat(String),
    Unknown(String),
    Empty,
}

impl Command {
    pub fn parse(line: &str) -> Self {
        let text = line.trim();
        if text.is_empty() {
            return Self::Empty;
        }
        let Some(rest) = text.strip_prefix('/') else {
            return Self::Chat(text.to_owned());
        };
        let (name, arg) = match rest.split_once(char::is_whitespace) {
            Some((name, arg)) => (name, arg.trim()),
            None => (rest, ""),
        };
        match name {
            "status" => Self::Status,
            "memory" => Self::Memory,
            "skills" => Self::Skills,
            "toggle" if !arg.is_empty() => Self::Toggle(arg.to_owned()),
            "tools" => Self::Tools,
            "config" => Self::Config,
            "services" => Self::Services,
            "restart" => Self::Restart,
            "stop" => Self::Stop,
            "reset" => Self::Reset,
            "q" | "exit" | "quit" => Self::Quit,
            "help" | "?" => Self::Help,
            _ => Self::Unknown(text.to_owned()),
        }
    }
}

pub const HELP: &str = "\
/status          lifecycle state and agent status
/memory          agent memory
/skills          list skills
/toggle <skill>  enable or disable a skill
/tools           list tools
/config          agent configuration
/services        connected services
/restart         stop and start the backend
/stop            stop the backend
/reset           forget saved settings
/quit            exit
anything else is sent to the agent";

pub fn render_chat(reply: &ChatResponse) -> String {
    let mut out = reply.response.clone();
    for call in &reply.tool_calls {
        out.push_str(&format!("\n  > {}", call.skill));
        if let Some(result) = call.result.as_deref().filter(|r| !r.is_empty()) {
            out.push_str(&format!(": {result}"));
        }
    }
    out
}

pub fn render_skills(skills: &SkillsResponse) -> String {
    if skills.skills.is_empty() {
        return "no skills".into();
    }
    skills
        .skills
        .iter()
        .map(|s| format!("[{}] {}", if s.enabled { "x" } else { " " }, s.name))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn render_tools(tools: &ToolsResponse) -> String {
    if tools.tools.is_empty() {
        return "no tools".into();
    }
    tools
        .tools
        .iter()
        .map(|t| match t.category.as_str() {
            "" => format!("{}  {}", t.name, t.description),
            category => format!("{} ({category})  {}", t.name, t.description),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn render_config(cfg: &AgentConfig) -> String {
    let flag = |on: bool| if on { "on" } else { "off" };
    format!(
        "agent: {}\nprovider: {}\nmemory: {}\nskills: {}\nscheduler: {}",
        cfg.agent_name,
        cfg.provider,
        flag(cfg.memory_enabled),
        flag(cfg.skills_enabled),
        flag(cfg.scheduler_enabled),
    )
}

pub fn render_services(status: &ConnectStatus) -> String {
    let mut lines: Vec<String> = status
        .services
        .iter()
        .map(|s| {
            let name = if s.display_name.is_empty() { &s.name } else { &s.display_name };
            let mut line = format!("[{}] {name}", if s.connected { "x" } else { " " });
            if !s.category.is_empty() {
                line.push_str(&format!(" ({})", s.category));
            }
            if let Some(detail) = s.detail.as_deref().filter(|d| !d.is_empty()) {
                line.push_str(&format!(" - {detail}"));
            } else if !s.connected && !s.connect_command.is_empty() {
                line.push_str(&format!(" - connect with `{}`", s.connect_command));
            }
            line
        })
        .collect();
    if !status.active_provider.is_empty() {
        lines.push(format!("active provider: {}", status.active_provider));
    }
    if lines.is_empty() {
        return "no services".into();
    }
    lines.join("\n")
}

pub fn render_json(value: &serde_json::Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}
