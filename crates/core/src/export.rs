use crate::query::{FileResult, QueryResult};

pub fn to_csv(files: &[FileResult], w: impl std::io::Write) -> csv::Result<()> {
    let mut writer = csv::Writer::from_writer(w);
    writer.write_record([
        "name", "exists", "new", "kind", "size", "mtime", "tick", "created_tick", "changed_at",
    ])?;
    for f in files {
        let kind = f.kind.map(|k| k.as_str()).unwrap_or_default();
        writer.write_record([
            f.name.clone(),
            f.exists.to_string(),
            f.new.to_string(),
            kind.to_string(),
            f.size.map(|s| s.to_string()).unwrap_or_default(),
            f.mtime.map(|m| m.to_rfc3339()).unwrap_or_default(),
            f.tick.to_string(),
            f.created_tick.to_string(),
            f.changed_at.to_rfc3339(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

pub fn to_json(result: &QueryResult) -> serde_json::Value {
    serde_json::json!({
        "clock": result.clock.to_string(),
        "is_fresh_instance": result.is_fresh_instance,
        "num_walked": result.num_walked,
        "files": result.files,
    })
}
