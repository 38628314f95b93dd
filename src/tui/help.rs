use ratatui::{
    layout::Rect,
    style::Color,
    style::Style,
    text::{Line, Span},
    widgets::{Block, Borders, Paragraph},
    Frame,
};

fn key_line(key: &'static str, pad: usize, desc: &'static str) -> Line<'static> {
    Line::from(vec![
        Span::raw("  "),
        Span::styled(key, Style::default().fg(Color::Magenta)),
        Span::raw(" ".repeat(pad)),
        Span::raw(desc),
    ])
}

pub fn draw_help(area: Rect, f: &mut Frame) {
    let p = Paragraph::new(vec![
        Line::from("Keybinds:"),
        Line::from(vec![
            Span::raw("  "),
            Span::styled("q", Style::default().fg(Color::Magenta)),
            Span::raw(" / "),
            Span::styled("Ctrl-C", Style::default().fg(Color::Magenta)),
            Span::raw("  Quit"),
        ]),
        key_line("tab", 9, "Switch tabs"),
        key_line("?", 11, "Show this help"),
        Line::from(""),
        Line::from("Generate tab:"),
        key_line("i", 11, "Edit image path"),
        key_line("p", 11, "Edit prompt"),
        Line::from(vec![
            Span::raw("  "),
            Span::styled("Enter", Style::default().fg(Color::Magenta)),
            Span::raw(" / "),
            Span::styled("g", Style::default().fg(Color::Magenta)),
            Span::raw("   Generate"),
        ]),
        key_line("c", 11, "Cancel the running generation"),
        key_line("e", 11, "Export last generation as JSON"),
        key_line("y", 11, "Copy output URL to clipboard"),
        Line::from(""),
        Line::from("While editing:"),
        key_line("Enter", 7, "Accept"),
        key_line("Esc", 9, "Discard changes"),
        Line::from(""),
        Line::from("History tab:"),
        Line::from(vec![
            Span::raw("  "),
            Span::styled("↑/↓", Style::default().fg(Color::Magenta)),
            Span::raw(" or "),
            Span::styled("j/k", Style::default().fg(Color::Magenta)),
            Span::raw("  Navigate"),
        ]),
        key_line("r", 11, "Refresh history"),
        key_line("y", 11, "Copy selected output URL"),
        Line::from(""),
        Line::from("Supported images: png, jpg, jpeg, gif up to 10 MiB."),
    ])
    .block(Block::default().borders(Borders::ALL).title("Help"));
    f.render_widget(p, area);
}
