use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, OnceLock};

use regex::Regex;

use crate::config::{parse_duration, ConstantValueSpec, DataDeclConfig, GeneratorSpec, TrxEntryConfig};
use crate::datagen::{
    CachedGenerator, ColumnGenerator, ConstantGenerator, DataScope, RandomIntGenerator, RawGenerator,
    Scope, SequentialIntGenerator, Value, ValueKind,
};
use crate::error::SqlmeterError;

use super::model::{
    BoundInput, BoundOutput, LimitKind, PrepareGroup, Statement, StatementFlags, TrxBoundary, TrxFile,
    TrxMeta, TrxSet,
};

/// Parse every `{name, file, dataDecls}` entry into a `TrxSet`, registering
/// declared data generators as they're encountered (spec.md §4.1).
///
/// Returns the shared `DataScope` the entries' generators (and any
/// `save-result`/`save-insert-id` columns produced while parsing) were
/// registered into; the allocator mints per-client copies from it.
pub fn load_trx_set(
    entries: &[TrxEntryConfig],
    base_dir: &Path,
) -> Result<(TrxSet, Arc<DataScope>), SqlmeterError> {
    let scope = Arc::new(DataScope::new());
    let mut trxs = Vec::with_capacity(entries.len());

    for entry in entries {
        register_declarations(&scope, &entry.data_decls)?;
        let path = base_dir.join(&entry.file);
        let text = std::fs::read_to_string(&path)?;
        let trx = load_one(&scope, &entry.name, &path.to_string_lossy(), &text)?;
        trxs.push(trx);
    }

    Ok((TrxSet { trxs }, scope))
}

fn register_declarations(scope: &DataScope, decls: &[DataDeclConfig]) -> Result<(), SqlmeterError> {
    for decl in decls {
        let gen_scope: Scope = decl
            .scope
            .parse()
            .map_err(|e| SqlmeterError::Validation(format!("data decl '{}': {e}", decl.name)))?;
        let raw: Arc<dyn RawGenerator> = match &decl.generator {
            GeneratorSpec::RandomInt { min, max } => Arc::new(RandomIntGenerator { min: *min, max: *max }),
            GeneratorSpec::SequentialInt { start, step } => {
                Arc::new(SequentialIntGenerator::new(*start, *step))
            }
            GeneratorSpec::Constant { value } => Arc::new(ConstantGenerator {
                value: match value {
                    ConstantValueSpec::Int(i) => Value::Int(*i),
                    ConstantValueSpec::Float(f) => Value::Float(*f),
                    ConstantValueSpec::Str(s) => Value::Str(s.clone()),
                },
            }),
        };
        scope.register(decl.name.clone(), Arc::new(CachedGenerator::new(raw, gen_scope)));
    }
    Ok(())
}

#[derive(Default)]
struct PendingStatement {
    start_line: usize,
    sql_lines: Vec<String>,
    prepare: bool,
    idle: Option<std::time::Duration>,
    limit: Option<LimitKind>,
    save_insert_id: Option<String>,
    save_result: Vec<String>,
    copies: Option<usize>,
}

fn load_one(
    scope: &DataScope,
    name: &str,
    file: &str,
    text: &str,
) -> Result<TrxFile, SqlmeterError> {
    let mut statements = Vec::new();
    let mut meta = TrxMeta::default();
    let mut pending = PendingStatement::default();
    let mut in_statement = false;
    let mut produced_columns: HashSet<String> = HashSet::new();
    let mut consumed_columns: HashSet<String> = HashSet::new();

    for (idx, raw_line) in text.lines().enumerate() {
        let line_no = idx + 1;
        let trimmed = raw_line.trim();

        if trimmed.eq_ignore_ascii_case("-- eof") {
            break;
        }
        if let Some(body) = trimmed.strip_prefix("--") {
            apply_modifier(&mut pending, body, file, line_no)?;
            continue;
        }
        if trimmed.is_empty() {
            if in_statement {
                finalize_statement(
                    scope,
                    file,
                    &mut pending,
                    &mut statements,
                    &mut meta,
                    &mut produced_columns,
                    &mut consumed_columns,
                )?;
                pending = PendingStatement::default();
                in_statement = false;
            }
            continue;
        }

        if !in_statement {
            pending.start_line = line_no;
            in_statement = true;
        }
        pending.sql_lines.push(trimmed.to_string());
    }

    if in_statement {
        finalize_statement(
            scope,
            file,
            &mut pending,
            &mut statements,
            &mut meta,
            &mut produced_columns,
            &mut consumed_columns,
        )?;
    }

    if let Some(col) = produced_columns.difference(&consumed_columns).next() {
        return Err(SqlmeterError::load(
            file,
            0,
            format!("saved column '@{col}' is never consumed"),
        ));
    }

    Ok(TrxFile {
        name: name.to_string(),
        path: file.to_string(),
        statements,
        meta,
    })
}

fn apply_modifier(
    pending: &mut PendingStatement,
    body: &str,
    file: &str,
    line: usize,
) -> Result<(), SqlmeterError> {
    let body = body.trim();
    if body.eq_ignore_ascii_case("prepare") || body.eq_ignore_ascii_case("prepared") {
        pending.prepare = true;
        return Ok(());
    }

    let (key, value) = body
        .split_once(':')
        .ok_or_else(|| SqlmeterError::load(file, line, format!("malformed modifier '{body}'")))?;
    let (key, value) = (key.trim(), value.trim());

    match key {
        "idle" => pending.idle = Some(parse_duration(value)?),
        "rows" => {
            let mut parts = value.split_whitespace();
            let limit = next_uint(&mut parts, file, line, "rows modifier missing count")?;
            let mut offset = 0u64;
            if let Some(tok) = parts.next() {
                if tok == "offset" {
                    offset = next_uint(&mut parts, file, line, "rows modifier offset missing value")?;
                } else {
                    return Err(SqlmeterError::load(file, line, format!("malformed rows modifier '{value}'")));
                }
            }
            pending.limit = Some(LimitKind::Rows { limit, offset });
        }
        "table-size" => {
            let mut parts = value.split_whitespace();
            let table = parts
                .next()
                .ok_or_else(|| SqlmeterError::load(file, line, "table-size modifier missing table name"))?
                .to_string();
            let bytes = next_uint(&mut parts, file, line, "table-size modifier missing byte count")?;
            pending.limit = Some(LimitKind::TableSize { table, bytes });
        }
        "database-size" => {
            let mut parts = value.split_whitespace();
            let database = parts
                .next()
                .ok_or_else(|| SqlmeterError::load(file, line, "database-size modifier missing database name"))?
                .to_string();
            let bytes = next_uint(&mut parts, file, line, "database-size modifier missing byte count")?;
            pending.limit = Some(LimitKind::DatabaseSize { database, bytes });
        }
        "save-insert-id" => {
            pending.save_insert_id = Some(value.trim_start_matches('@').to_string());
        }
        "save-result" => {
            pending.save_result = value.split_whitespace().map(str::to_string).collect();
        }
        "copies" => {
            pending.copies = Some(
                value
                    .parse()
                    .map_err(|_| SqlmeterError::load(file, line, "copies modifier not an integer"))?,
            );
        }
        other => {
            return Err(SqlmeterError::load(file, line, format!("unknown modifier '{other}'")));
        }
    }
    Ok(())
}

fn next_uint(
    parts: &mut std::str::SplitWhitespace<'_>,
    file: &str,
    line: usize,
    missing_msg: &str,
) -> Result<u64, SqlmeterError> {
    parts
        .next()
        .ok_or_else(|| SqlmeterError::load(file, line, missing_msg))?
        .parse()
        .map_err(|_| SqlmeterError::load(file, line, "expected an integer"))
}

fn classify(sql: &str) -> StatementFlags {
    let first_word = sql
        .trim_start()
        .split(|c: char| c.is_whitespace() || c == '(')
        .next()
        .unwrap_or("")
        .to_ascii_uppercase();

    let mut flags = StatementFlags::default();
    match first_word.as_str() {
        "SELECT" => flags.result_set = true,
        "BEGIN" | "START" => flags.begin = true,
        "COMMIT" => flags.commit = true,
        "INSERT" | "UPDATE" | "DELETE" | "REPLACE" => flags.write = true,
        "ALTER" | "CREATE" | "DROP" | "RENAME" | "TRUNCATE" => flags.ddl = true,
        _ => {}
    }
    flags
}

fn csv_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"/\*!csv\s+(\d+)\s+([^*]+?)\s*\*/").expect("valid csv regex"))
}

/// Expand `/*!csv N val*/` into `val, val, …` (spec.md §4.1).
fn expand_csv(text: &str) -> String {
    csv_regex()
        .replace_all(text, |caps: &regex::Captures| {
            let n: usize = caps[1].parse().unwrap_or(0);
            let val = caps[2].trim();
            std::iter::repeat(val).take(n).collect::<Vec<_>>().join(", ")
        })
        .into_owned()
}

fn token_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"@(PREV)(\(\))?|@([A-Za-z_][A-Za-z0-9_]*)(\(\))?").expect("valid token regex")
    })
}

/// Replace `@name`, `@name()`, `@PREV` tokens with `?` positional
/// placeholders, resolving each against the data scope and recording which
/// names were consumed (spec.md §4.1 "Recognized inline tokens").
fn resolve_tokens(
    scope: &DataScope,
    text: &str,
    file: &str,
    line: usize,
    consumed_columns: &mut HashSet<String>,
) -> Result<(String, Vec<BoundInput>), SqlmeterError> {
    let re = token_regex();
    let mut output = String::with_capacity(text.len());
    let mut last_end = 0;
    let mut inputs = Vec::new();
    let mut prev: Option<(String, Arc<CachedGenerator>)> = None;

    for caps in re.captures_iter(text) {
        let whole = caps.get(0).expect("capture group 0 always present");
        output.push_str(&text[last_end..whole.start()]);
        last_end = whole.end();

        if caps.get(1).is_some() {
            let (prev_name, prev_gen) = prev.clone().ok_or_else(|| {
                SqlmeterError::load(file, line, "@PREV used with no preceding input reference")
            })?;
            let forced = caps.get(2).is_some();
            inputs.push(BoundInput {
                name: prev_name.clone(),
                generator: prev_gen.clone(),
                forced,
            });
            consumed_columns.insert(prev_name.clone());
            prev = Some((prev_name, prev_gen));
        } else {
            let name = caps
                .get(3)
                .expect("second alternative always captures a name")
                .as_str()
                .to_string();
            let forced = caps.get(4).is_some();
            let generator = scope.get(&format!("@{name}")).ok_or_else(|| {
                SqlmeterError::load(file, line, format!("reference to undeclared data key '@{name}'"))
            })?;
            consumed_columns.insert(name.clone());
            inputs.push(BoundInput {
                name: name.clone(),
                generator: generator.clone(),
                forced,
            });
            prev = Some((name, generator));
        }
        output.push('?');
    }
    output.push_str(&text[last_end..]);
    Ok((output, inputs))
}

#[allow(clippy::too_many_arguments)]
fn finalize_statement(
    scope: &DataScope,
    file: &str,
    pending: &mut PendingStatement,
    statements: &mut Vec<Statement>,
    meta: &mut TrxMeta,
    produced_columns: &mut HashSet<String>,
    consumed_columns: &mut HashSet<String>,
) -> Result<(), SqlmeterError> {
    let raw_sql = pending.sql_lines.join(" ");
    let base_sql = expand_csv(&raw_sql);
    let mut flags = classify(&base_sql);
    flags.prepare = pending.prepare;
    if flags.ddl {
        meta.ddl = true;
    }
    let trx_boundary = TrxBoundary {
        begin: flags.begin,
        end: flags.commit,
    };

    let n_copies = pending.copies.unwrap_or(1);
    if n_copies == 0 {
        return Err(SqlmeterError::load(file, pending.start_line, "copies modifier must be >= 1"));
    }
    let has_placeholder = base_sql.contains("/*!copy-number*/");
    let leader_index = statements.len();

    for copy_no in 1..=n_copies {
        let text = if has_placeholder {
            base_sql.replace("/*!copy-number*/", &copy_no.to_string())
        } else {
            base_sql.clone()
        };

        let (sql, inputs) = resolve_tokens(scope, &text, file, pending.start_line, consumed_columns)?;

        let mut outputs = Vec::new();
        let mut insert_id = None;

        // Outputs are registered once, off the first copy: replicated
        // copies share identical save semantics, so registering per-copy
        // would just rebind the same name to an equivalent generator.
        if copy_no == 1 {
            if let Some(key) = &pending.save_insert_id {
                let gen = Arc::new(CachedGenerator::new(
                    Arc::new(ColumnGenerator::new(ValueKind::Int)),
                    Scope::Statement,
                ));
                scope.register(format!("@{key}"), gen.clone());
                produced_columns.insert(key.clone());
                insert_id = Some(gen);
            }
            for col in &pending.save_result {
                if col == "_" {
                    continue;
                }
                let col_name = col.trim_start_matches('@').to_string();
                let gen = Arc::new(CachedGenerator::new(
                    Arc::new(ColumnGenerator::new(ValueKind::Int)),
                    Scope::Statement,
                ));
                scope.register(format!("@{col_name}"), gen.clone());
                produced_columns.insert(col_name.clone());
                outputs.push(BoundOutput {
                    name: col_name,
                    generator: gen,
                });
            }
        }

        let prepare_group = if flags.prepare && n_copies > 1 && !has_placeholder {
            Some(PrepareGroup { leader_index, size: n_copies })
        } else {
            None
        };

        statements.push(Statement {
            file: file.to_string(),
            line: pending.start_line,
            sql,
            flags,
            trx_boundary,
            idle: pending.idle,
            limit: pending.limit.clone(),
            inputs,
            outputs,
            insert_id,
            copy_number: if n_copies > 1 { Some(copy_no) } else { None },
            prepare_group,
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(dir: &tempfile::TempDir, name: &str, contents: &str) -> String {
        let path = dir.path().join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        name.to_string()
    }

    fn entry(name: &str, file: String, decls: Vec<DataDeclConfig>) -> TrxEntryConfig {
        TrxEntryConfig {
            name: name.to_string(),
            file,
            data_decls: decls,
        }
    }

    fn int_decl(name: &str, min: i64, max: i64, scope: &str) -> DataDeclConfig {
        DataDeclConfig {
            name: name.to_string(),
            generator: GeneratorSpec::RandomInt { min, max },
            scope: scope.to_string(),
        }
    }

    #[test]
    fn select_smoke_loads_one_statement() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_temp(&dir, "001.sql", "select c from t where id=@id\n");
        let entries = vec![entry("select1", file, vec![int_decl("@id", 1, 100, "statement")])];
        let (set, _scope) = load_trx_set(&entries, dir.path()).unwrap();
        let trx = set.find("select1").unwrap();
        assert_eq!(trx.statements.len(), 1);
        let stmt = &trx.statements[0];
        assert!(stmt.flags.result_set);
        assert_eq!(stmt.sql, "select c from t where id=?");
        assert_eq!(stmt.inputs.len(), 1);
    }

    #[test]
    fn save_insert_id_registers_column_generator() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_temp(
            &dir,
            "ins.sql",
            "-- save-insert-id: @id\nINSERT INTO writetest VALUES (NULL, @d)\n",
        );
        let entries = vec![entry("ins", file, vec![int_decl("@d", 1, 1, "statement")])];
        let (set, scope) = load_trx_set(&entries, dir.path()).unwrap();
        let trx = set.find("ins").unwrap();
        assert_eq!(trx.statements.len(), 1);
        assert!(trx.statements[0].flags.write);
        assert!(trx.statements[0].insert_id.is_some());
        assert!(scope.get("@id").is_some());
    }

    #[test]
    fn undeclared_reference_is_a_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_temp(&dir, "bad.sql", "select * from t where id=@missing\n");
        let entries = vec![entry("bad", file, vec![])];
        let err = load_trx_set(&entries, dir.path()).unwrap_err();
        assert!(err.to_string().contains("undeclared data key"));
    }

    #[test]
    fn unconsumed_saved_column_is_a_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_temp(
            &dir,
            "dangling.sql",
            "-- save-result: @c1\nSELECT c1 FROM t\n",
        );
        let entries = vec![entry("dangling", file, vec![])];
        let err = load_trx_set(&entries, dir.path()).unwrap_err();
        assert!(err.to_string().contains("never consumed"));
    }

    #[test]
    fn copies_expands_and_substitutes_copy_number() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_temp(
            &dir,
            "copies.sql",
            "-- copies: 3\nINSERT INTO t(shard) VALUES (/*!copy-number*/)\n",
        );
        let entries = vec![entry("copies", file, vec![])];
        let (set, _scope) = load_trx_set(&entries, dir.path()).unwrap();
        let trx = set.find("copies").unwrap();
        assert_eq!(trx.statements.len(), 3);
        assert_eq!(trx.statements[0].sql, "INSERT INTO t(shard) VALUES (1)");
        assert_eq!(trx.statements[2].sql, "INSERT INTO t(shard) VALUES (3)");
        assert!(trx.statements.iter().all(|s| s.prepare_group.is_none()));
    }

    #[test]
    fn copies_with_prepare_and_no_placeholder_share_prepare_group() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_temp(
            &dir,
            "shared.sql",
            "-- prepare\n-- copies: 4\nINSERT INTO t(x) VALUES (@d)\n",
        );
        let entries = vec![entry("shared", file, vec![int_decl("@d", 1, 1, "statement")])];
        let (set, _scope) = load_trx_set(&entries, dir.path()).unwrap();
        let trx = set.find("shared").unwrap();
        assert_eq!(trx.statements.len(), 4);
        for s in &trx.statements {
            let group = s.prepare_group.expect("all copies share a prepare group");
            assert_eq!(group.leader_index, 0);
            assert_eq!(group.size, 4);
        }
    }

    #[test]
    fn csv_expansion_repeats_value() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_temp(&dir, "csv.sql", "SELECT /*!csv 3 ?*/\n");
        let entries = vec![entry("csv", file, vec![])];
        let (set, _scope) = load_trx_set(&entries, dir.path()).unwrap();
        assert_eq!(set.find("csv").unwrap().statements[0].sql, "SELECT ?, ?, ?");
    }

    #[test]
    fn prev_token_reuses_preceding_generator() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_temp(&dir, "prev.sql", "SELECT * FROM t WHERE a=@x AND b=@PREV\n");
        let entries = vec![entry("prev", file, vec![int_decl("@x", 1, 10, "row")])];
        let (set, _scope) = load_trx_set(&entries, dir.path()).unwrap();
        let stmt = &set.find("prev").unwrap().statements[0];
        assert_eq!(stmt.inputs.len(), 2);
        assert!(Arc::ptr_eq(&stmt.inputs[0].generator, &stmt.inputs[1].generator));
    }

    #[test]
    fn eof_marker_stops_parsing_early() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_temp(&dir, "eof.sql", "SELECT 1\n\n-- EOF\nSELECT 2\n");
        let entries = vec![entry("eof", file, vec![])];
        let (set, _scope) = load_trx_set(&entries, dir.path()).unwrap();
        assert_eq!(set.find("eof").unwrap().statements.len(), 1);
    }

    #[test]
    fn ddl_statement_marks_trx_meta() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_temp(&dir, "ddl.sql", "CREATE TABLE t (id INT)\n");
        let entries = vec![entry("ddl", file, vec![])];
        let (set, _scope) = load_trx_set(&entries, dir.path()).unwrap();
        assert!(set.find("ddl").unwrap().meta.ddl);
    }
}
