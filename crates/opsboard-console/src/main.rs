use crossterm::{
    event::{Event, EventStream, KeyCode, KeyEvent, KeyEventKind, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use futures_util::StreamExt;
use opsboard_core::{
    AgentStatus, ApprovalRequest, ChatRole, SpanStatus, Trace, TraceStatus,
};
use opsboard_gateway::{
    processor, transport, ApprovalBus, GatewayConfig, GatewayNotice, LinkState, OperatorState,
    StoreAction,
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span, Text},
    widgets::{Block, Borders, Clear, List, ListItem, Paragraph, Wrap},
    Terminal,
};
use serde_json::json;
use std::collections::VecDeque;
use std::error::Error;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::warn;
use tracing_subscriber::EnvFilter;

const COMMAND_QUEUE_CAPACITY: usize = 64;
const REDRAW_INTERVAL_MS: u64 = 250;
const CHAT_HISTORY_ROWS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Agents,
    Traces,
    Chat,
}

impl Mode {
    fn title(&self) -> &'static str {
        match self {
            Mode::Agents => "Agents",
            Mode::Traces => "Traces",
            Mode::Chat => "Chat",
        }
    }

    fn next(&self) -> Self {
        match self {
            Mode::Agents => Mode::Traces,
            Mode::Traces => Mode::Chat,
            Mode::Chat => Mode::Agents,
        }
    }
}

#[derive(Debug)]
enum ConsoleCommand {
    SendChat { agent_id: Option<String>, content: String },
    RespondApproval { id: String, approved: bool },
}

struct App {
    state: OperatorState,
    mode: Mode,
    link: LinkState,
    scroll: u16,
    chat_input: String,
    pending_approval: Option<ApprovalRequest>,
    approval_queue: VecDeque<ApprovalRequest>,
    status_note: Option<String>,
    approvals: ApprovalBus,
    command_tx: mpsc::Sender<ConsoleCommand>,
}

impl App {
    fn new(mock: bool, command_tx: mpsc::Sender<ConsoleCommand>) -> Self {
        let state = if mock {
            OperatorState::seeded()
        } else {
            OperatorState::empty()
        };
        Self {
            state,
            mode: Mode::Agents,
            link: if mock {
                LinkState::Connected
            } else {
                LinkState::Disconnected
            },
            scroll: 0,
            chat_input: String::new(),
            pending_approval: None,
            approval_queue: VecDeque::new(),
            status_note: None,
            approvals: ApprovalBus::new(),
            command_tx,
        }
    }

    fn next_mode(&mut self) {
        self.mode = self.mode.next();
        self.scroll = 0;
    }

    fn apply_notice(&mut self, notice: GatewayNotice) {
        match notice {
            GatewayNotice::Link(link) => {
                self.link = link;
                self.status_note = Some(match link {
                    LinkState::Connected => "gateway connected".to_string(),
                    LinkState::Connecting => "connecting to gateway".to_string(),
                    LinkState::Reconnecting => "gateway reconnecting".to_string(),
                    LinkState::Disconnected => "gateway disconnected".to_string(),
                    LinkState::Unreachable => "gateway unreachable".to_string(),
                });
            }
            GatewayNotice::Event(event) => {
                let approvals = processor::apply_event(&mut self.state, event);
                for approval in approvals {
                    self.approvals.publish(approval);
                }
            }
        }
    }

    fn take_approval(&mut self, request: ApprovalRequest) {
        if self.pending_approval.is_some() {
            self.approval_queue.push_back(request);
        } else {
            self.pending_approval = Some(request);
        }
    }

    fn respond_approval(&mut self, approved: bool) {
        let Some(approval) = self.pending_approval.take() else {
            return;
        };
        let verdict = if approved { "approved" } else { "rejected" };
        self.status_note = Some(format!("{verdict} {} for {}", approval.tool, approval.agent_id));
        if self
            .command_tx
            .try_send(ConsoleCommand::RespondApproval {
                id: approval.id,
                approved,
            })
            .is_err()
        {
            warn!(event = "approval_respond_dropped");
        }
        self.pending_approval = self.approval_queue.pop_front();
    }

    fn dismiss_approval(&mut self) {
        if self.pending_approval.take().is_some() {
            self.status_note = Some("approval dismissed".to_string());
        }
        self.pending_approval = self.approval_queue.pop_front();
    }

    fn send_chat(&mut self) {
        let content = self.chat_input.trim().to_string();
        if content.is_empty() {
            return;
        }
        self.chat_input.clear();
        if self
            .command_tx
            .try_send(ConsoleCommand::SendChat {
                agent_id: self.state.selected_agent.clone(),
                content,
            })
            .is_err()
        {
            self.status_note = Some("chat queue full; message dropped".to_string());
        }
    }

    fn selected_agent_index(&self) -> usize {
        let Some(selected) = self.state.selected_agent.as_deref() else {
            return 0;
        };
        self.state
            .agents
            .keys()
            .position(|id| id == selected)
            .unwrap_or(0)
    }

    fn move_agent_selection(&mut self, delta: i64) {
        if self.state.agents.is_empty() {
            return;
        }
        let count = self.state.agents.len() as i64;
        let current = self.selected_agent_index() as i64;
        let next = (current + delta).rem_euclid(count) as usize;
        let id = self.state.agents.keys().nth(next).cloned();
        self.state.apply(StoreAction::SelectAgent(id));
    }

    fn active_trace(&self) -> Option<&Trace> {
        self.state
            .active_trace_id
            .as_deref()
            .and_then(|id| self.state.trace(id))
            .or_else(|| self.state.traces.last())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let config = load_config();
    let mock = config.mock;
    init_logging();

    let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
    let (notice_tx, mut notice_rx) = mpsc::channel(256);
    tokio::spawn(async move {
        gateway_loop(config, notice_tx, command_rx).await;
    });

    let mut app = App::new(mock, command_tx);
    let mut approval_rx = app.approvals.subscribe();

    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;
    let mut events = EventStream::new();
    let mut redraw_ticker =
        tokio::time::interval(Duration::from_millis(REDRAW_INTERVAL_MS));

    loop {
        terminal.draw(|frame| render_ui(frame, &app))?;
        tokio::select! {
            _ = redraw_ticker.tick() => {}
            Some(notice) = notice_rx.recv() => {
                app.apply_notice(notice);
            }
            approval = approval_rx.recv() => {
                match approval {
                    Ok(request) => app.take_approval(request),
                    Err(_) => {}
                }
            }
            maybe_event = events.next() => {
                if let Some(Ok(event)) = maybe_event {
                    if handle_input(event, &mut app) {
                        break;
                    }
                }
            }
        }
    }

    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;
    Ok(())
}

/// Owns the transport and fans notices up to the app; RPC commands run on
/// their own tasks so a slow gateway never stalls event delivery.
async fn gateway_loop(
    config: GatewayConfig,
    notice_tx: mpsc::Sender<GatewayNotice>,
    mut command_rx: mpsc::Receiver<ConsoleCommand>,
) {
    let (handle, mut notices) = transport::spawn(config);
    let handle = Arc::new(handle);

    loop {
        tokio::select! {
            maybe = notices.recv() => {
                match maybe {
                    Some(notice) => {
                        if notice_tx.send(notice).await.is_err() {
                            return;
                        }
                    }
                    None => return,
                }
            }
            maybe = command_rx.recv() => {
                let Some(command) = maybe else { return };
                let handle = handle.clone();
                tokio::spawn(async move {
                    match command {
                        ConsoleCommand::SendChat { agent_id, content } => {
                            let params = json!({ "agent_id": agent_id, "content": content });
                            if let Err(err) = handle.call("chat.send", params).await {
                                warn!(event = "chat_send_error", error = %err);
                            }
                        }
                        ConsoleCommand::RespondApproval { id, approved } => {
                            let params = json!({ "id": id, "approved": approved });
                            if let Err(err) = handle.call("approval.respond", params).await {
                                warn!(event = "approval_respond_error", error = %err);
                            }
                        }
                    }
                });
            }
        }
    }
}

fn handle_input(event: Event, app: &mut App) -> bool {
    match event {
        Event::Key(key) if key.kind == KeyEventKind::Press => handle_key(key, app),
        _ => false,
    }
}

fn handle_key(key: KeyEvent, app: &mut App) -> bool {
    if key.code == KeyCode::Char('c') && key.modifiers.contains(KeyModifiers::CONTROL) {
        return true;
    }

    if app.pending_approval.is_some() {
        match key.code {
            KeyCode::Char('y') => app.respond_approval(true),
            KeyCode::Char('n') => app.respond_approval(false),
            KeyCode::Esc => app.dismiss_approval(),
            _ => {}
        }
        return false;
    }

    if app.mode == Mode::Chat {
        match key.code {
            KeyCode::Tab => app.next_mode(),
            KeyCode::Enter => app.send_chat(),
            KeyCode::Esc => app.chat_input.clear(),
            KeyCode::Backspace => {
                app.chat_input.pop();
            }
            KeyCode::Char(c) => app.chat_input.push(c),
            _ => {}
        }
        return false;
    }

    match key.code {
        KeyCode::Char('q') => true,
        KeyCode::Tab => {
            app.next_mode();
            false
        }
        KeyCode::Char('1') => {
            app.mode = Mode::Agents;
            app.scroll = 0;
            false
        }
        KeyCode::Char('2') => {
            app.mode = Mode::Traces;
            app.scroll = 0;
            false
        }
        KeyCode::Char('3') => {
            app.mode = Mode::Chat;
            app.scroll = 0;
            false
        }
        KeyCode::Down | KeyCode::Char('j') => {
            if app.mode == Mode::Agents {
                app.move_agent_selection(1);
            } else {
                app.scroll = app.scroll.saturating_add(1);
            }
            false
        }
        KeyCode::Up | KeyCode::Char('k') => {
            if app.mode == Mode::Agents {
                app.move_agent_selection(-1);
            } else {
                app.scroll = app.scroll.saturating_sub(1);
            }
            false
        }
        _ => false,
    }
}

#[derive(Clone, Copy)]
struct Theme {
    border: Color,
    title: Color,
    text: Color,
    muted: Color,
    accent: Color,
    ok: Color,
    warn: Color,
    critical: Color,
}

fn theme() -> Theme {
    Theme {
        border: Color::Rgb(71, 85, 105),
        title: Color::Rgb(191, 219, 254),
        text: Color::Rgb(226, 232, 240),
        muted: Color::Rgb(148, 163, 184),
        accent: Color::Rgb(56, 189, 248),
        ok: Color::Rgb(34, 197, 94),
        warn: Color::Rgb(245, 158, 11),
        critical: Color::Rgb(239, 68, 68),
    }
}

fn render_ui(frame: &mut ratatui::Frame, app: &App) {
    let theme = theme();
    let layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Min(0),
            Constraint::Length(3),
        ])
        .split(frame.size());

    frame.render_widget(render_header(app, theme), layout[0]);
    match app.mode {
        Mode::Agents => render_agents(frame, app, theme, layout[1]),
        Mode::Traces => render_traces(frame, app, theme, layout[1]),
        Mode::Chat => render_chat(frame, app, theme, layout[1]),
    }
    frame.render_widget(render_footer(app, theme), layout[2]);

    if let Some(approval) = app.pending_approval.as_ref() {
        render_approval_modal(frame, approval, theme);
    }
}

fn link_style(link: LinkState, theme: Theme) -> Style {
    let color = match link {
        LinkState::Connected => theme.ok,
        LinkState::Connecting | LinkState::Reconnecting => theme.warn,
        LinkState::Disconnected | LinkState::Unreachable => theme.critical,
    };
    Style::default().fg(color)
}

fn render_header(app: &App, theme: Theme) -> Paragraph<'static> {
    let active = app
        .state
        .agents
        .values()
        .filter(|agent| agent.status == AgentStatus::Active)
        .count();
    let line = Line::from(vec![
        Span::styled(
            format!(" {} ", app.mode.title()),
            Style::default()
                .fg(theme.accent)
                .add_modifier(Modifier::BOLD),
        ),
        Span::styled(
            format!("gateway:{} ", app.link.as_str()),
            link_style(app.link, theme),
        ),
        Span::styled(
            format!(
                "agents:{active}/{} traces:{} cost:${:.4}",
                app.state.agents.len(),
                app.state.traces.len(),
                app.state.session_cost,
            ),
            Style::default().fg(theme.text),
        ),
    ]);
    Paragraph::new(line).block(
        Block::default()
            .borders(Borders::ALL)
            .border_style(Style::default().fg(theme.border))
            .title(Span::styled("opsboard", Style::default().fg(theme.title))),
    )
}

fn render_footer(app: &App, theme: Theme) -> Paragraph<'static> {
    let hint = match app.mode {
        Mode::Chat => "Tab switch | Enter send | Esc clear",
        _ => "Tab switch | 1/2/3 mode | j/k move | q quit",
    };
    let text = match app.status_note.as_deref() {
        Some(note) => format!("{note}  |  {hint}"),
        None => hint.to_string(),
    };
    Paragraph::new(Span::styled(text, Style::default().fg(theme.muted))).block(
        Block::default()
            .borders(Borders::ALL)
            .border_style(Style::default().fg(theme.border)),
    )
}

fn render_agents(frame: &mut ratatui::Frame, app: &App, theme: Theme, area: Rect) {
    let selected = app.selected_agent_index();
    let items: Vec<ListItem> = app
        .state
        .agents
        .values()
        .enumerate()
        .map(|(index, agent)| {
            let status_color = match agent.status {
                AgentStatus::Active => theme.ok,
                AgentStatus::Idle => theme.muted,
                AgentStatus::Error => theme.critical,
                AgentStatus::Paused => theme.warn,
            };
            let marker = if index == selected { "▶ " } else { "  " };
            let task = agent.current_task.as_deref().unwrap_or("-");
            let thinking = if app.state.agent_thinking && index == selected {
                " …"
            } else {
                ""
            };
            let line = Line::from(vec![
                Span::styled(marker.to_string(), Style::default().fg(theme.accent)),
                Span::styled(
                    format!("{:<12}", agent.name),
                    Style::default()
                        .fg(theme.text)
                        .add_modifier(Modifier::BOLD),
                ),
                Span::styled(
                    format!("{:<10}", agent.status),
                    Style::default().fg(status_color),
                ),
                Span::styled(
                    format!("{:<14}", agent.model),
                    Style::default().fg(theme.muted),
                ),
                Span::styled(
                    format!(
                        "done:{:<4} ${:<8.4} {task}{thinking}",
                        agent.tasks_completed, agent.session_cost,
                    ),
                    Style::default().fg(theme.text),
                ),
            ]);
            ListItem::new(line)
        })
        .collect();

    let list = List::new(items).block(
        Block::default()
            .borders(Borders::ALL)
            .border_style(Style::default().fg(theme.border))
            .title(Span::styled("agents", Style::default().fg(theme.title))),
    );
    frame.render_widget(list, area);
}

fn trace_status_color(status: TraceStatus, theme: Theme) -> Color {
    match status {
        TraceStatus::Running => theme.warn,
        TraceStatus::Success => theme.ok,
        TraceStatus::Error => theme.critical,
    }
}

fn span_glyph(status: SpanStatus) -> &'static str {
    match status {
        SpanStatus::Success => "✓",
        SpanStatus::Error => "✗",
        SpanStatus::Slow => "~",
        SpanStatus::Running => "▸",
        SpanStatus::Pending => "·",
    }
}

fn render_traces(frame: &mut ratatui::Frame, app: &App, theme: Theme, area: Rect) {
    let halves = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Percentage(40), Constraint::Percentage(60)])
        .split(area);

    let items: Vec<ListItem> = app
        .state
        .traces
        .iter()
        .rev()
        .map(|trace| {
            let agent = trace.agent_id.as_deref().unwrap_or("-");
            let line = Line::from(vec![
                Span::styled(
                    format!("{:<10}", short_id(&trace.id)),
                    Style::default().fg(theme.text),
                ),
                Span::styled(
                    format!("{:<9}", trace.status.as_str()),
                    Style::default().fg(trace_status_color(trace.status, theme)),
                ),
                Span::styled(
                    format!(
                        "{} spans:{:<3} ${:<9.4} {agent}",
                        trace.started_at.format("%H:%M:%S"),
                        trace.spans.len(),
                        trace.total_cost,
                    ),
                    Style::default().fg(theme.muted),
                ),
            ]);
            ListItem::new(line)
        })
        .collect();
    let list = List::new(items).block(
        Block::default()
            .borders(Borders::ALL)
            .border_style(Style::default().fg(theme.border))
            .title(Span::styled("traces", Style::default().fg(theme.title))),
    );
    frame.render_widget(list, halves[0]);

    let mut lines: Vec<Line> = Vec::new();
    if let Some(trace) = app.active_trace() {
        for span in &trace.spans {
            lines.push(Line::from(vec![
                Span::styled(
                    format!(" {} ", span_glyph(span.status)),
                    Style::default().fg(match span.status {
                        SpanStatus::Error => theme.critical,
                        SpanStatus::Success => theme.ok,
                        _ => theme.warn,
                    }),
                ),
                Span::styled(
                    format!("{:<14}", span.kind.as_str()),
                    Style::default().fg(theme.text),
                ),
                Span::styled(
                    format!("{:<6}ms ${:.4}", span.duration_ms, span.cost),
                    Style::default().fg(theme.muted),
                ),
            ]));
        }
    }
    let detail = Paragraph::new(Text::from(lines))
        .scroll((app.scroll, 0))
        .block(
            Block::default()
                .borders(Borders::ALL)
                .border_style(Style::default().fg(theme.border))
                .title(Span::styled("spans", Style::default().fg(theme.title))),
        );
    frame.render_widget(detail, halves[1]);
}

fn render_chat(frame: &mut ratatui::Frame, app: &App, theme: Theme, area: Rect) {
    let halves = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(0), Constraint::Length(3)])
        .split(area);

    let mut lines: Vec<Line> = Vec::new();
    let start = app.state.messages.len().saturating_sub(CHAT_HISTORY_ROWS);
    for message in &app.state.messages[start..] {
        let (label, color) = match message.role {
            ChatRole::User => ("you", theme.accent),
            ChatRole::Agent => ("agent", theme.ok),
            ChatRole::System => ("system", theme.muted),
            ChatRole::Tool => ("tool", theme.warn),
        };
        lines.push(Line::from(vec![
            Span::styled(
                format!("{label:>6} "),
                Style::default().fg(color).add_modifier(Modifier::BOLD),
            ),
            Span::styled(message.content.clone(), Style::default().fg(theme.text)),
        ]));
        for call in &message.tool_calls {
            lines.push(Line::from(Span::styled(
                format!("       └ {} [{}]", call.tool, call.approval.as_str()),
                Style::default().fg(theme.muted),
            )));
        }
    }
    let history = Paragraph::new(Text::from(lines))
        .wrap(Wrap { trim: false })
        .scroll((app.scroll, 0))
        .block(
            Block::default()
                .borders(Borders::ALL)
                .border_style(Style::default().fg(theme.border))
                .title(Span::styled("chat", Style::default().fg(theme.title))),
        );
    frame.render_widget(history, halves[0]);

    let input = Paragraph::new(Line::from(vec![
        Span::styled("> ", Style::default().fg(theme.accent)),
        Span::styled(app.chat_input.clone(), Style::default().fg(theme.text)),
    ]))
    .block(
        Block::default()
            .borders(Borders::ALL)
            .border_style(Style::default().fg(theme.border)),
    );
    frame.render_widget(input, halves[1]);
}

fn render_approval_modal(frame: &mut ratatui::Frame, approval: &ApprovalRequest, theme: Theme) {
    let area = centered_rect(frame.size(), 60, 9);
    frame.render_widget(Clear, area);
    let params = serde_json::to_string(&approval.params).unwrap_or_default();
    let mut lines = vec![
        Line::from(Span::styled(
            format!("{} wants to run {}", approval.agent_id, approval.tool),
            Style::default()
                .fg(theme.text)
                .add_modifier(Modifier::BOLD),
        )),
        Line::from(Span::styled(
            ellipsize(&params, (area.width as usize).saturating_sub(4)),
            Style::default().fg(theme.muted),
        )),
    ];
    if let Some(description) = approval.description.as_deref() {
        lines.push(Line::from(Span::styled(
            description.to_string(),
            Style::default().fg(theme.text),
        )));
    }
    lines.push(Line::from(Span::styled(
        "[y] approve   [n] reject   [esc] dismiss",
        Style::default().fg(theme.accent),
    )));
    let modal = Paragraph::new(Text::from(lines)).wrap(Wrap { trim: true }).block(
        Block::default()
            .borders(Borders::ALL)
            .border_style(Style::default().fg(theme.warn))
            .title(Span::styled(
                "approval required",
                Style::default().fg(theme.warn),
            )),
    );
    frame.render_widget(modal, area);
}

fn centered_rect(area: Rect, width: u16, height: u16) -> Rect {
    let width = width.min(area.width);
    let height = height.min(area.height);
    Rect {
        x: area.x + (area.width - width) / 2,
        y: area.y + (area.height - height) / 2,
        width,
        height,
    }
}

fn short_id(id: &str) -> String {
    id.chars().take(10).collect()
}

fn ellipsize(value: &str, max: usize) -> String {
    if value.chars().count() <= max {
        return value.to_string();
    }
    let kept: String = value.chars().take(max.saturating_sub(1)).collect();
    format!("{kept}…")
}

fn load_config() -> GatewayConfig {
    let mock = std::env::args().any(|arg| arg == "--mock") || env_true("OPSBOARD_MOCK");
    let mut config = if mock {
        GatewayConfig::mock()
    } else {
        GatewayConfig::default()
    };
    if let Ok(url) = std::env::var("OPSBOARD_GATEWAY_URL") {
        if !url.trim().is_empty() {
            config.url = url;
        }
    }
    if let Ok(token) = std::env::var("OPSBOARD_GATEWAY_TOKEN") {
        if !token.trim().is_empty() {
            config.token = Some(token);
        }
    }
    config
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stdout_enabled = env_true("OPSBOARD_LOG_STDOUT");
    // The terminal belongs to the UI; logs go to a sink unless asked for.
    if stdout_enabled {
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    } else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(io::sink)
            .try_init();
    }
}

fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}
