//! Snapshot commands: take, restore, rename, comment, delete and list.

use super::{truncate, OpenVm, COMMENT_WIDTH};
use clap::Args;
use fleetvm::Snapshot;

// ============================================================================
// Snapshot Command
// ============================================================================

/// Take a snapshot of a stopped VM.
#[derive(Args, Debug)]
pub struct SnapshotCmd {
    /// VM name
    pub vm: String,

    /// Snapshot name (defaults to snapshotN)
    #[arg(short, long, default_value = "")]
    pub name: String,

    /// Free-form comment
    #[arg(short, long, default_value = "")]
    pub comment: String,
}

impl SnapshotCmd {
    pub fn run(self) -> fleetvm::Result<()> {
        let open = OpenVm::open(&self.vm)?;
        let snapshot = open.vm.take_snapshot(&self.name, &self.comment)?;
        println!("Snapshot taken: {}.{}", self.vm, snapshot.name);
        Ok(())
    }
}

// ============================================================================
// Restore Command
// ============================================================================

/// Restore a stopped VM to a snapshot.
#[derive(Args, Debug)]
pub struct RestoreCmd {
    /// VM name
    pub vm: String,

    /// Snapshot to restore
    pub snapshot: String,

    /// Discard the current state instead of snapshotting it first
    #[arg(short, long)]
    pub destructive: bool,
}

impl RestoreCmd {
    pub fn run(self) -> fleetvm::Result<()> {
        let mut open = OpenVm::open(&self.vm)?;
        if self.destructive {
            open.vm.restore_snapshot(&self.snapshot)?;
        } else {
            let kept = open.vm.restore_snapshot_keeping_current(&self.snapshot)?;
            println!("Current state saved as: {}.{}", self.vm, kept.name);
        }
        open.save()?;
        println!("Snapshot restored: {}.{}", self.vm, self.snapshot);
        Ok(())
    }
}

// ============================================================================
// Rename / Comment Commands
// ============================================================================

/// Rename a snapshot.
#[derive(Args, Debug)]
pub struct RenameSnapshotCmd {
    /// VM name
    pub vm: String,

    /// Current snapshot name
    pub snapshot: String,

    /// New snapshot name
    pub new_name: String,
}

impl RenameSnapshotCmd {
    pub fn run(self) -> fleetvm::Result<()> {
        let open = OpenVm::open(&self.vm)?;
        open.vm.rename_snapshot(&self.snapshot, &self.new_name)?;
        println!("Snapshot renamed: {}.{} -> {}", self.vm, self.snapshot, self.new_name);
        Ok(())
    }
}

/// Replace a snapshot's comment.
#[derive(Args, Debug)]
pub struct CommentCmd {
    /// VM name
    pub vm: String,

    /// Snapshot name
    pub snapshot: String,

    /// New comment (empty clears it)
    #[arg(default_value = "")]
    pub comment: String,
}

impl CommentCmd {
    pub fn run(self) -> fleetvm::Result<()> {
        let open = OpenVm::open(&self.vm)?;
        open.vm.set_snapshot_comment(&self.snapshot, &self.comment)?;
        println!("Comment updated: {}.{}", self.vm, self.snapshot);
        Ok(())
    }
}

// ============================================================================
// Delete Command
// ============================================================================

/// Delete a snapshot, reparenting its children.
#[derive(Args, Debug)]
pub struct DeleteSnapshotCmd {
    /// VM name
    pub vm: String,

    /// Snapshot to delete
    pub snapshot: String,
}

impl DeleteSnapshotCmd {
    pub fn run(self) -> fleetvm::Result<()> {
        let open = OpenVm::open(&self.vm)?;
        open.vm.delete_snapshot(&self.snapshot)?;
        println!("Snapshot deleted: {}.{}", self.vm, self.snapshot);
        Ok(())
    }
}

// ============================================================================
// List Command
// ============================================================================

/// Show a VM's snapshot tree.
#[derive(Args, Debug)]
pub struct ListCmd {
    /// VM name
    pub vm: String,
}

impl ListCmd {
    pub fn run(self) -> fleetvm::Result<()> {
        let open = OpenVm::open(&self.vm)?;
        let snapshots = open.vm.view_snapshots();
        if snapshots.is_empty() {
            println!("No snapshots for {}", self.vm);
            return Ok(());
        }

        let head = open.vm.head_snapshot().map(|s| s.name);
        for line in render_tree(&snapshots, head.as_deref()) {
            println!("{}", line);
        }
        Ok(())
    }
}

/// Render snapshots (in creation order) as an indented tree. The head is
/// marked with `*`.
fn render_tree(snapshots: &[Snapshot], head: Option<&str>) -> Vec<String> {
    fn walk(
        snapshots: &[Snapshot],
        parent: Option<&str>,
        prefix: &str,
        head: Option<&str>,
        lines: &mut Vec<String>,
    ) {
        let children: Vec<_> = snapshots
            .iter()
            .filter(|s| s.parent.as_deref() == parent)
            .collect();

        for (i, snapshot) in children.iter().enumerate() {
            let last = i + 1 == children.len();
            let (branch, indent) = match (parent, last) {
                (None, _) => ("", ""),
                (Some(_), true) => ("└── ", "    "),
                (Some(_), false) => ("├── ", "│   "),
            };
            let marker = if head == Some(snapshot.name.as_str()) { " *" } else { "" };
            let mut line = format!(
                "{}{}{}{}  ({})",
                prefix,
                branch,
                snapshot.name,
                marker,
                snapshot.created_at.format("%Y-%m-%d %H:%M:%S")
            );
            if !snapshot.comment.is_empty() {
                line.push_str("  ");
                line.push_str(&truncate(&snapshot.comment, COMMENT_WIDTH));
            }
            lines.push(line);

            let child_prefix = format!("{}{}", prefix, indent);
            walk(snapshots, Some(&snapshot.name), &child_prefix, head, lines);
        }
    }

    let mut lines = Vec::new();
    walk(snapshots, None, "", head, &mut lines);
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetvm::{VmSpecs, VmState};

    fn snapshot(index: u32, name: &str, parent: Option<&str>, comment: &str) -> Snapshot {
        Snapshot::new(
            index,
            name,
            comment,
            parent.map(str::to_string),
            VmState::Off,
            VmSpecs::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_render_tree() {
        let snapshots = vec![
            snapshot(1, "base", None, "fresh install"),
            snapshot(2, "left", Some("base"), ""),
            snapshot(3, "deep", Some("left"), ""),
            snapshot(4, "right", Some("base"), ""),
        ];

        let lines: Vec<String> = render_tree(&snapshots, Some("right"))
            .into_iter()
            .map(|l| l.split("  (").next().unwrap().to_string())
            .collect();
        assert_eq!(
            lines,
            ["base", "├── left", "│   └── deep", "└── right *"]
        );
    }
}
