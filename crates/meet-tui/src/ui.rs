use anyhow::Result;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::execute;
use crossterm::terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen};
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Clear, List, ListItem, ListState, Paragraph, Wrap};
use ratatui::{Frame, Terminal};
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::input::{self, Command};
use crate::media::MediaCapture;
use crate::presence::PresenceSync;
use crate::rooms::RoomRegistry;
use crate::session::{self, EntryMode, Membership, SessionState};
use crate::util;

pub struct App {
    pub registry: RoomRegistry,
    pub capture: Box<dyn MediaCapture>,
    pub log_dir: PathBuf,
    pub default_user: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Quit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Name,
    Room,
}

struct Lobby {
    name: String,
    room: String,
    join_mode: bool,
    is_private: bool,
    focus: Field,
    selected: usize,
    status: String,
}

struct InRoom {
    membership: Membership,
    input: String,
    status: String,
    confirm: bool,
}

struct Ui {
    app: App,
    presence: PresenceSync,
    session: SessionState,
    lobby: Lobby,
    room: Option<InRoom>,
}

/// Runs until the user quits or a termination signal arrives. Either way
/// the current room, if any, is left before returning.
pub async fn run(app: App, mut signals: mpsc::Receiver<&'static str>) -> Result<()> {
    let presence = PresenceSync::attach(app.registry.clone()).await?;
    let mut ui = Ui {
        lobby: Lobby {
            name: app.default_user.clone(),
            room: String::new(),
            join_mode: false,
            is_private: false,
            focus: if app.default_user.is_empty() { Field::Name } else { Field::Room },
            selected: 0,
            status: String::from("Tab: create/join  Enter: go  Esc: quit"),
        },
        app,
        presence,
        session: SessionState::new(),
        room: None,
    };

    enable_raw_mode()?;
    let mut terminal = match setup_terminal() {
        Ok(t) => t,
        Err(e) => {
            let _ = disable_raw_mode();
            let _ = execute!(io::stdout(), LeaveAlternateScreen);
            return Err(e);
        }
    };

    let res = ui.event_loop(&mut terminal, &mut signals).await;
    // leave on every exit path, including errors out of the loop
    if let Err(e) = ui.leave_room(false).await {
        warn!(error = %e, "leave on shutdown failed");
    }
    cleanup(&mut terminal)?;
    res
}

impl Ui {
    async fn event_loop(
        &mut self,
        terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
        signals: &mut mpsc::Receiver<&'static str>,
    ) -> Result<()> {
        loop {
            terminal.draw(|f| self.draw(f))?;

            if let Ok(sig) = signals.try_recv() {
                info!(signal = sig, "shutting down");
                return Ok(());
            }

            if event::poll(Duration::from_millis(100))? {
                if let Event::Key(key) = event::read()? {
                    if key.kind != KeyEventKind::Press {
                        continue;
                    }
                    match self.on_key(key).await {
                        Ok(Flow::Quit) => return Ok(()),
                        Ok(Flow::Continue) => {}
                        Err(e) => {
                            warn!(error = %e, "action failed");
                            self.set_status(format!("error: {e}"));
                        }
                    }
                }
            }

            if let Err(e) = self.presence.poll().await {
                warn!(error = %e, "presence sync failed");
            }
            self.clamp_selection();
        }
    }

    fn set_status(&mut self, msg: String) {
        match self.room.as_mut() {
            Some(r) => r.status = msg,
            None => self.lobby.status = msg,
        }
    }

    fn clamp_selection(&mut self) {
        let n = self.presence.rooms().len();
        if self.lobby.selected >= n {
            self.lobby.selected = n.saturating_sub(1);
        }
    }

    fn current_admins(&self) -> Vec<String> {
        let Some(id) = self.session.current_room_id.as_deref() else {
            return Vec::new();
        };
        self.presence
            .rooms()
            .iter()
            .find(|r| r.id == id)
            .map(|r| r.admins.clone())
            .unwrap_or_default()
    }

    async fn on_key(&mut self, key: KeyEvent) -> Result<Flow> {
        if let (KeyCode::Char('c'), KeyModifiers::CONTROL) = (key.code, key.modifiers) {
            return Ok(Flow::Quit);
        }
        if self.room.is_some() {
            self.on_room_key(key).await
        } else {
            self.on_lobby_key(key).await
        }
    }

    async fn on_lobby_key(&mut self, key: KeyEvent) -> Result<Flow> {
        let lobby = &mut self.lobby;
        match (key.code, key.modifiers) {
            (KeyCode::Esc, _) => return Ok(Flow::Quit),
            (KeyCode::Tab, _) => {
                lobby.join_mode = !lobby.join_mode;
                if lobby.join_mode {
                    lobby.focus = Field::Name;
                }
            }
            (KeyCode::Char('p'), KeyModifiers::CONTROL) => lobby.is_private = !lobby.is_private,
            (KeyCode::Up, _) => {
                if lobby.join_mode {
                    lobby.selected = lobby.selected.saturating_sub(1);
                } else {
                    lobby.focus = Field::Name;
                }
            }
            (KeyCode::Down, _) => {
                if lobby.join_mode {
                    lobby.selected += 1;
                } else {
                    lobby.focus = Field::Room;
                }
            }
            (KeyCode::Backspace, _) => util::pop_grapheme(lobby.focused_mut()),
            (KeyCode::Enter, _) => self.submit_entry().await?,
            (KeyCode::Char(ch), KeyModifiers::NONE) | (KeyCode::Char(ch), KeyModifiers::SHIFT) => {
                let field = lobby.focused_mut();
                if field.len() < 64 {
                    field.push(ch);
                }
            }
            _ => {}
        }
        Ok(Flow::Continue)
    }

    async fn submit_entry(&mut self) -> Result<()> {
        let (room, mode) = if self.lobby.join_mode {
            match self.presence.rooms().get(self.lobby.selected) {
                Some(r) => (r.id.clone(), EntryMode::Join),
                None => {
                    self.lobby.status = "No active rooms.".into();
                    return Ok(());
                }
            }
        } else {
            let is_private = self.lobby.is_private;
            (self.lobby.room.clone(), EntryMode::Create { is_private })
        };

        let entered = session::enter(
            &mut self.session,
            self.presence.registry(),
            &self.lobby.name,
            &room,
            mode,
        )
        .await;
        let membership = match entered {
            Ok(m) => m,
            Err(e) => {
                self.lobby.status = e.to_string();
                self.presence.refresh().await?;
                return Ok(());
            }
        };

        let mut status = match self.session.toggle_camera(self.app.capture.as_ref()) {
            Ok(_) => String::from("camera on"),
            Err(e) => format!("{e}; camera off"),
        };
        if !self.session.is_admin {
            status.push_str(" | room is at host capacity, joined as guest");
        }
        self.presence.watch_room(Some(membership.room_id())).await?;
        self.room = Some(InRoom {
            membership,
            input: String::new(),
            status,
            confirm: false,
        });
        Ok(())
    }

    async fn on_room_key(&mut self, key: KeyEvent) -> Result<Flow> {
        let Some(room) = self.room.as_mut() else {
            return Ok(Flow::Continue);
        };
        if room.confirm {
            match key.code {
                KeyCode::Char('y') | KeyCode::Char('Y') | KeyCode::Enter => {
                    let with_log = self.session.is_admin;
                    self.leave_room(with_log).await?;
                }
                KeyCode::Char('n') | KeyCode::Char('N') | KeyCode::Esc => room.confirm = false,
                _ => {}
            }
            return Ok(Flow::Continue);
        }
        match (key.code, key.modifiers) {
            (KeyCode::Esc, _) => room.confirm = true,
            (KeyCode::Backspace, _) => util::pop_grapheme(&mut room.input),
            (KeyCode::Enter, _) => {
                let line = std::mem::take(&mut room.input);
                return self.on_line(&line).await;
            }
            (KeyCode::Char(ch), KeyModifiers::NONE) | (KeyCode::Char(ch), KeyModifiers::SHIFT) => {
                if room.input.len() < 500 {
                    room.input.push(ch);
                }
            }
            _ => {}
        }
        Ok(Flow::Continue)
    }

    async fn on_line(&mut self, line: &str) -> Result<Flow> {
        let Some(cmd) = input::parse_command(line) else {
            let me = self.session.user_name.clone();
            self.session.add_message(&me, line);
            return Ok(Flow::Continue);
        };
        let capture = self.app.capture.as_ref();
        let status = match cmd {
            Command::Help => input::HELP.to_string(),
            Command::Quit => return Ok(Flow::Quit),
            Command::Leave => {
                if let Some(r) = self.room.as_mut() {
                    r.confirm = true;
                }
                return Ok(Flow::Continue);
            }
            Command::Mute => {
                let muted = self.session.toggle_mute();
                (if muted { "muted" } else { "unmuted" }).to_string()
            }
            Command::Camera => match self.session.toggle_camera(capture) {
                Ok(true) => "camera on".into(),
                Ok(false) => "camera off".into(),
                Err(e) => e.to_string(),
            },
            Command::Share => match self.session.toggle_screen_share(capture) {
                Ok(true) => "sharing screen".into(),
                Ok(false) => "stopped sharing".into(),
                Err(e) => e.to_string(),
            },
            Command::Hand => self.toggle_hand().await?,
            Command::Who => {
                let admins = self.current_admins();
                format!("hosts: {}", admins.join(", "))
            }
            Command::Log => {
                if self.session.is_admin {
                    let admins = self.current_admins();
                    let path = self.session.write_meeting_log(&self.app.log_dir, &admins)?;
                    format!("log saved to {}", path.display())
                } else {
                    "only hosts can download the log".into()
                }
            }
        };
        self.set_status(status);
        Ok(Flow::Continue)
    }

    async fn toggle_hand(&mut self) -> Result<String> {
        let Some(id) = self.session.current_room_id.clone() else {
            return Ok(String::new());
        };
        let user = self.session.user_name.clone();
        let raised = self.session.toggle_hand();
        let registry = self.presence.registry();
        let res = if raised {
            registry.raise_hand(&id, &user).await
        } else {
            registry.lower_hand(&id, &user).await
        };
        if let Err(e) = res {
            self.session.toggle_hand();
            return Err(e);
        }
        self.presence.refresh().await?;
        Ok(if raised { "hand raised" } else { "hand lowered" }.to_string())
    }

    async fn leave_room(&mut self, with_log: bool) -> Result<()> {
        let Some(room) = self.room.take() else {
            return Ok(());
        };
        let mut note = String::from("left the meeting");
        if with_log {
            let admins = self.current_admins();
            match self.session.write_meeting_log(&self.app.log_dir, &admins) {
                Ok(path) => note = format!("left the meeting, log saved to {}", path.display()),
                Err(e) => note = format!("left the meeting, log failed: {e}"),
            }
        }
        let res = session::exit(&mut self.session, room.membership).await;
        self.presence.watch_room(None).await?;
        self.lobby.status = note;
        res
    }

    fn draw(&self, f: &mut Frame) {
        match &self.room {
            Some(room) => self.draw_room(f, room),
            None => self.draw_lobby(f),
        }
    }

    fn draw_lobby(&self, f: &mut Frame) {
        let lobby = &self.lobby;
        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Length(3),
                Constraint::Length(3),
                Constraint::Min(3),
                Constraint::Length(1),
            ])
            .split(f.size());

        let accent = Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD);
        let dim = Style::default().fg(Color::DarkGray);
        let tabs = Line::from(vec![
            Span::styled(" CREATE ", if lobby.join_mode { dim } else { accent }),
            Span::raw(" | "),
            Span::styled(" JOIN ", if lobby.join_mode { accent } else { dim }),
        ]);
        f.render_widget(
            Paragraph::new(tabs).block(Block::default().borders(Borders::ALL).title("meet")),
            chunks[0],
        );

        f.render_widget(
            field("your name", &lobby.name, lobby.focus == Field::Name),
            chunks[1],
        );

        if lobby.join_mode {
            let items: Vec<ListItem> = self
                .presence
                .rooms()
                .iter()
                .map(|r| {
                    let tag = if r.is_private { "[private]" } else { "#" };
                    ListItem::new(format!("{tag} {}  ({} hosts online)", r.id, r.admins.len()))
                })
                .collect();
            let title = if items.is_empty() { "no active rooms" } else { "active rooms" };
            let list = List::new(items)
                .block(Block::default().borders(Borders::ALL).title(title))
                .highlight_style(accent)
                .highlight_symbol("> ");
            let mut state = ListState::default();
            if !self.presence.rooms().is_empty() {
                state.select(Some(lobby.selected));
            }
            f.render_stateful_widget(list, chunks[2], &mut state);
        } else {
            let inner = Layout::default()
                .direction(Direction::Vertical)
                .constraints([Constraint::Length(3), Constraint::Min(0)])
                .split(chunks[2]);
            f.render_widget(
                field("room name", &lobby.room, lobby.focus == Field::Room),
                inner[0],
            );
            let privacy = if lobby.is_private { "private (Ctrl-P)" } else { "public (Ctrl-P)" };
            f.render_widget(Paragraph::new(privacy).style(dim), inner[1]);
        }

        f.render_widget(
            Paragraph::new(Span::styled(lobby.status.as_str(), Style::default().fg(Color::Gray))),
            chunks[3],
        );
    }

    fn draw_room(&self, f: &mut Frame, room: &InRoom) {
        let s = &self.session;
        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Length(3),
                Constraint::Min(3),
                Constraint::Length(1),
                Constraint::Length(3),
                Constraint::Length(1),
            ])
            .split(f.size());

        let mut header = vec![Span::styled(
            s.current_room_id.clone().unwrap_or_default(),
            Style::default().add_modifier(Modifier::BOLD),
        )];
        for admin in self.current_admins() {
            let label = if admin == s.user_name { "You".to_string() } else { admin };
            header.push(Span::raw("  "));
            header.push(Span::styled(format!("[{label}]"), Style::default().fg(Color::Magenta)));
        }
        for hand in self.presence.hands() {
            header.push(Span::styled(format!("  ✋{hand}"), Style::default().fg(Color::Yellow)));
        }
        f.render_widget(
            Paragraph::new(Line::from(header)).block(Block::default().borders(Borders::ALL)),
            chunks[0],
        );

        let mut lines: Vec<Line> = Vec::new();
        if s.is_camera_off() {
            lines.push(Line::from(Span::styled(
                format!("({})", util::initial(&s.user_name)),
                Style::default().fg(Color::Blue),
            )));
        }
        for m in s.transcript() {
            lines.push(Line::from(vec![
                Span::styled(format!("[{}] ", m.time_label()), Style::default().fg(Color::DarkGray)),
                Span::styled(format!("{}: ", m.sender), Style::default().fg(Color::Cyan)),
                Span::raw(m.text.clone()),
            ]));
        }
        let skip = lines.len().saturating_sub(chunks[1].height.saturating_sub(2) as usize);
        let chat = Paragraph::new(lines.into_iter().skip(skip).collect::<Vec<_>>())
            .block(Block::default().borders(Borders::ALL).title("chat"))
            .wrap(Wrap { trim: false });
        f.render_widget(chat, chunks[1]);

        let flag = |on: bool, yes: &'static str, no: &'static str| {
            if on {
                Span::styled(yes, Style::default().fg(Color::Green))
            } else {
                Span::styled(no, Style::default().fg(Color::Red))
            }
        };
        let controls = Line::from(vec![
            flag(!s.is_muted, "mic on", "muted"),
            Span::raw(" | "),
            flag(!s.is_camera_off(), "cam on", "cam off"),
            Span::raw(" | "),
            flag(s.is_sharing_screen(), "sharing", "not sharing"),
            Span::raw(" | "),
            flag(s.is_hand_raised, "hand up", "hand down"),
            Span::raw(if s.is_admin { " | host" } else { " | guest" }),
        ]);
        f.render_widget(Paragraph::new(controls), chunks[2]);

        f.render_widget(field("message or /command", &room.input, true), chunks[3]);
        f.render_widget(
            Paragraph::new(Span::styled(room.status.as_str(), Style::default().fg(Color::Gray))),
            chunks[4],
        );

        if room.confirm {
            let (title, body) = if s.is_admin {
                ("End Meeting?", "You are a host. Download Log & End? (y/n)")
            } else {
                ("Leave Meeting?", "Are you sure you want to leave the meeting? (y/n)")
            };
            let area = centered(f.size(), 54, 5);
            f.render_widget(Clear, area);
            f.render_widget(
                Paragraph::new(body)
                    .wrap(Wrap { trim: true })
                    .block(Block::default().borders(Borders::ALL).title(title)),
                area,
            );
        }
    }
}

impl Lobby {
    fn focused_mut(&mut self) -> &mut String {
        match self.focus {
            Field::Name => &mut self.name,
            Field::Room if !self.join_mode => &mut self.room,
            Field::Room => &mut self.name,
        }
    }
}

fn field<'a>(title: &'a str, value: &'a str, focused: bool) -> Paragraph<'a> {
    let border = if focused {
        Style::default().fg(Color::Cyan)
    } else {
        Style::default()
    };
    Paragraph::new(value).block(
        Block::default()
            .borders(Borders::ALL)
            .border_style(border)
            .title(title),
    )
}

fn centered(area: Rect, width: u16, height: u16) -> Rect {
    let w = width.min(area.width);
    let h = height.min(area.height);
    Rect {
        x: area.x + (area.width - w) / 2,
        y: area.y + (area.height - h) / 2,
        width: w,
        height: h,
    }
}

fn setup_terminal() -> Result<Terminal<CrosstermBackend<io::Stdout>>> {
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    Ok(Terminal::new(CrosstermBackend::new(stdout))?)
}

fn cleanup(terminal: &mut Terminal<CrosstermBackend<io::Stdout>>) -> Result<()> {
    disable_raw_mode()?;
    let w = terminal.backend_mut();
    crossterm::execute!(w, LeaveAlternateScreen)?;
    terminal.show_cursor()?;
    Ok(())
}
