//! `/etc/passwd` and `/etc/group` databases.

use botstrap_shared::errors::{BotstrapError, BotstrapResult};

/// One `/etc/passwd` record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswdEntry {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub gecos: String,
    pub home: String,
    pub shell: String,
}

impl PasswdEntry {
    pub fn to_line(&self) -> String {
        format!(
            "{}:x:{}:{}:{}:{}:{}",
            self.name, self.uid, self.gid, self.gecos, self.home, self.shell
        )
    }
}

/// One `/etc/group` record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupEntry {
    pub name: String,
    pub gid: u32,
    pub members: Vec<String>,
}

impl GroupEntry {
    pub fn to_line(&self) -> String {
        format!("{}:x:{}:{}", self.name, self.gid, self.members.join(","))
    }
}

fn parse_id(field: &str, file: &str, lineno: usize) -> BotstrapResult<u32> {
    field.parse::<u32>().map_err(|_| {
        BotstrapError::Install(format!("{} line {}: invalid id '{}'", file, lineno, field))
    })
}

/// Parse passwd content. Blank lines and `#` comments are skipped.
pub fn parse_passwd(content: &str) -> BotstrapResult<Vec<PasswdEntry>> {
    let mut entries = Vec::new();
    for (index, line) in content.lines().enumerate() {
        let line = line.trim_end();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() != 7 {
            return Err(BotstrapError::Install(format!(
                "/etc/passwd line {}: expected 7 fields, found {}",
                index + 1,
                fields.len()
            )));
        }
        entries.push(PasswdEntry {
            name: fields[0].to_string(),
            uid: parse_id(fields[2], "/etc/passwd", index + 1)?,
            gid: parse_id(fields[3], "/etc/passwd", index + 1)?,
            gecos: fields[4].to_string(),
            home: fields[5].to_string(),
            shell: fields[6].to_string(),
        });
    }
    Ok(entries)
}

/// Parse group content. Blank lines and `#` comments are skipped.
pub fn parse_group(content: &str) -> BotstrapResult<Vec<GroupEntry>> {
    let mut entries = Vec::new();
    for (index, line) in content.lines().enumerate() {
        let line = line.trim_end();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() != 4 {
            return Err(BotstrapError::Install(format!(
                "/etc/group line {}: expected 4 fields, found {}",
                index + 1,
                fields.len()
            )));
        }
        entries.push(GroupEntry {
            name: fields[0].to_string(),
            gid: parse_id(fields[2], "/etc/group", index + 1)?,
            members: fields[3]
                .split(',')
                .filter(|m| !m.is_empty())
                .map(str::to_string)
                .collect(),
        });
    }
    Ok(entries)
}

/// Append a line to file content, keeping a single trailing newline.
pub fn append_line(content: &str, line: &str) -> String {
    let mut out = content.to_string();
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(line);
    out.push('\n');
    out
}
