use console::{Emoji, style};

pub static SUCCESS_ICON: Emoji<'_, '_> = Emoji("✅ ", "");
pub static INFO_ICON: Emoji<'_, '_> = Emoji("ℹ️  ", "");
pub static WARN_ICON: Emoji<'_, '_> = Emoji("⚠️  ", "");
pub static ERROR_ICON: Emoji<'_, '_> = Emoji("❌ ", "");
pub static GEAR: Emoji<'_, '_> = Emoji("⚙️  ", "");
pub static SPARKLE: Emoji<'_, '_> = Emoji("✨ ", "");

pub fn print_success(msg: &str) {
    println!("{} {}", SUCCESS_ICON, style(msg).green());
}

pub fn print_info(msg: &str) {
    println!("{} {}", INFO_ICON, style(msg).blue());
}

pub fn print_warn(msg: &str) {
    println!("{} {}", WARN_ICON, style(msg).yellow());
}

pub fn print_error(msg: &str) {
    eprintln!("{} {}", ERROR_ICON, style(msg).red().bold());
}

pub fn print_status(label: &str, msg: &str) {
    println!("  {} {}: {}", GEAR, style(label).bold().cyan(), msg);
}

pub fn print_banner() {
    println!();
    println!(
        "{} {}",
        style("desk-relay").bold().cyan(),
        style(env!("CARGO_PKG_VERSION")).dim()
    );
    println!(
        "{}\n",
        style("Bulk ticket creation for help desk profiles.").cyan()
    );
}

pub fn print_goodbye() {
    println!(
        "\n{} {}",
        SPARKLE,
        style("Relay stopped. Running jobs were ended.").bold().cyan()
    );
}

enum GuideRow {
    Command(String, String),
    Status(String, String),
    Text(String),
    Blank,
}

/// A titled block of help or status rows.
pub struct GuideSection {
    title: String,
    rows: Vec<GuideRow>,
}

impl GuideSection {
    pub fn new(title: &str) -> Self {
        Self {
            title: title.to_string(),
            rows: Vec::new(),
        }
    }

    pub fn command(mut self, name: &str, description: &str) -> Self {
        self.rows
            .push(GuideRow::Command(name.to_string(), description.to_string()));
        self
    }

    pub fn status(mut self, label: &str, value: &str) -> Self {
        self.rows
            .push(GuideRow::Status(label.to_string(), value.to_string()));
        self
    }

    pub fn text(mut self, line: &str) -> Self {
        self.rows.push(GuideRow::Text(line.to_string()));
        self
    }

    pub fn blank(mut self) -> Self {
        self.rows.push(GuideRow::Blank);
        self
    }

    pub fn print(&self) {
        println!("\n {}", style(&self.title).bold().underlined());
        let width = self
            .rows
            .iter()
            .filter_map(|r| match r {
                GuideRow::Command(name, _) => Some(name.len()),
                _ => None,
            })
            .max()
            .unwrap_or(0);
        for row in &self.rows {
            match row {
                GuideRow::Command(name, description) => println!(
                    "   {}  {}",
                    style(format!("{:<width$}", name, width = width)).green(),
                    description
                ),
                GuideRow::Status(label, value) => {
                    println!("   {}: {}", style(label).bold().cyan(), value)
                }
                GuideRow::Text(line) => println!("   {}", line),
                GuideRow::Blank => println!(),
            }
        }
    }
}
