//! Scripted MCP peer for tests that need a real child process.

use std::path::Path;

use super::types::ServerConfig;

/// Minimal line-oriented MCP server in POSIX sh.
///
/// Knobs (environment):
/// - `FAKE_NAME`: reported in `serverInfo` and tool output (default `fake`)
/// - `FAKE_TOOLS`: JSON array returned by `tools/list`
/// - `FAKE_NO_PING`: when set, `ping` is never answered
const FAKE_PEER_SCRIPT: &str = r#"#!/bin/sh
name=${FAKE_NAME:-fake}
if [ -z "$FAKE_TOOLS" ]; then
  FAKE_TOOLS='[{"name":"echo","description":"Echo text back","inputSchema":{"type":"object","properties":{"text":{"type":"string"}},"required":["text"]}}]'
fi
while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/.*"id":\([0-9][0-9]*\).*/\1/p')
  [ -z "$id" ] && continue
  case "$line" in
    *'"method":"initialize"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2024-11-05","capabilities":{"tools":{}},"serverInfo":{"name":"%s","version":"0.1.0"}}}\n' "$id" "$name" ;;
    *'"method":"tools/list"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":%s}}\n' "$id" "$FAKE_TOOLS" ;;
    *'"method":"tools/call"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"handled by %s"}]}}\n' "$id" "$name" ;;
    *'"method":"ping"'*)
      [ -n "$FAKE_NO_PING" ] || printf '{"jsonrpc":"2.0","id":%s,"result":{}}\n' "$id" ;;
  esac
done
"#;

/// Write the fake peer into `dir` and return a launch spec for it.
pub(crate) fn fake_peer(dir: &Path, env: &[(&str, &str)]) -> ServerConfig {
    let script = dir.join("fake_peer.sh");
    if !script.exists() {
        std::fs::write(&script, FAKE_PEER_SCRIPT).expect("write fake peer script");
    }

    let mut config = ServerConfig::new("sh", vec![script.to_string_lossy().into_owned()]);
    for (key, value) in env {
        config.env.insert((*key).to_string(), (*value).to_string());
    }
    config
}
