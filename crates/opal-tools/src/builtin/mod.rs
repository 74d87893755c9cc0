// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod ask_user;
mod edit_file;
mod list_dir;
mod read_file;
mod shell;
mod write_file;

pub use ask_user::AskUserTool;
pub use edit_file::EditFileTool;
pub use list_dir::ListDirTool;
pub use read_file::ReadFileTool;
pub use shell::ShellTool;
pub use write_file::WriteFileTool;

use crate::ToolRegistry;

/// The standard registry for an interactive session, minus any tools the
/// config disables.
pub fn builtin_registry(disabled: &[String]) -> ToolRegistry {
    let mut reg = ToolRegistry::new();
    reg.register(ShellTool);
    reg.register(ReadFileTool);
    reg.register(WriteFileTool);
    reg.register(EditFileTool);
    reg.register(ListDirTool);
    reg.register(AskUserTool);
    for name in disabled {
        reg.remove(name);
    }
    reg
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registry_has_standard_tools() {
        let reg = builtin_registry(&[]);
        assert_eq!(
            reg.names(),
            vec![
                "ask_user",
                "edit_file",
                "list_dir",
                "read_file",
                "shell",
                "write_file"
            ]
        );
    }

    #[test]
    fn disabled_tools_are_removed() {
        let reg = builtin_registry(&["shell".to_string()]);
        assert!(reg.get("shell").is_none());
        assert!(reg.get("read_file").is_some());
    }
}
