//! Table and text rendering for CLI output.

use comfy_table::{presets::UTF8_FULL, Cell, Color, ContentArrangement, Table};

use crepo_core::models::{BranchStatus, CommitDesc, IndexStatus, ResourceInfo, ResourceType};

fn table(header: Vec<&str>) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(header);
    table
}

pub fn status(status: &BranchStatus) -> String {
    let mut out = format!("Branch {}: {}", status.name, status.state);
    if status.merge_pending {
        out.push_str(" (merge pending)");
    }
    if status.file_status.is_empty() {
        return out;
    }

    let mut t = table(vec!["", "Path", "From"]);
    for entry in &status.file_status {
        let code = Cell::new(entry.index_status.code());
        let code = if entry.index_status == IndexStatus::Unmerged {
            code.fg(Color::Red)
        } else {
            code
        };
        t.add_row(vec![
            code,
            Cell::new(&entry.path),
            Cell::new(entry.original_path.as_deref().unwrap_or("")),
        ]);
    }
    format!("{out}\n{t}")
}

pub fn log(commits: &[CommitDesc]) -> String {
    if commits.is_empty() {
        return "No commits.".to_string();
    }
    let mut t = table(vec!["Commit", "Date", "Author", "Message"]);
    for c in commits {
        let short = &c.id[..12.min(c.id.len())];
        t.add_row(vec![
            Cell::new(short),
            Cell::new(c.date.format("%Y-%m-%d %H:%M:%S").to_string()),
            Cell::new(format!("{} <{}>", c.author_name, c.author_email)),
            Cell::new(c.message.lines().next().unwrap_or("")),
        ]);
    }
    t.to_string()
}

pub fn commit(c: &CommitDesc) -> String {
    format!("[{}] {}", &c.id[..12.min(c.id.len())], c.message.trim_end())
}

pub fn info(info: &ResourceInfo) -> String {
    let mut t = table(vec!["Field", "Value"]);
    let kind = match info.resource_type {
        ResourceType::File => "file",
        ResourceType::Directory => "directory",
    };
    t.add_row(vec!["Path", info.path.as_str()]);
    t.add_row(vec!["Type", kind]);
    let size = info.size.to_string();
    t.add_row(vec!["Size", size.as_str()]);
    let modified = chrono::DateTime::from_timestamp_millis(info.last_modified)
        .map(|d| d.to_rfc3339())
        .unwrap_or_else(|| "-".to_string());
    t.add_row(vec!["Modified", modified.as_str()]);
    if info.resource_type == ResourceType::Directory {
        let children = info.sub_resource_names.join("\n");
        t.add_row(vec!["Children", children.as_str()]);
    }
    t.to_string()
}
