//! Self-contained HTML report over every record in a run directory.

use serde::Serialize;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use wattbench_core::{BenchmarkRunRecord, Result};

use crate::extract::escape_html;
use crate::layout::{REPORT_FILE, SUMMARY_FILE};

/// One table row, flattened for the page script.
#[derive(Debug, Clone, Serialize)]
pub struct ReportRow {
    pub unit: String,
    pub backend: String,
    pub timestamp_ms: u64,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub max_tokens: Option<i32>,
    pub gpu_setting: Option<String>,
    pub load_time_seconds: Option<f64>,
    pub generation_time_seconds: Option<f64>,
    pub tokens_per_second: Option<f64>,
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
    pub cost: Option<f64>,
    pub cpu_w_avg: Option<f64>,
    pub cpu_w_max: Option<f64>,
    pub gpu_w_avg: Option<f64>,
    pub gpu_w_max: Option<f64>,
    pub ane_w_avg: Option<f64>,
    pub ane_w_max: Option<f64>,
    pub package_w_avg: Option<f64>,
    pub samplers: Option<String>,
    pub rss_hwm_bytes: Option<u64>,
    pub system_hwm_bytes: Option<u64>,
    pub error: Option<String>,
    pub html_href: Option<String>,
    pub log_href: Option<String>,
    pub json_href: String,
}

impl ReportRow {
    pub fn from_record(record: &BenchmarkRunRecord, json_path: &Path, report_dir: &Path) -> Self {
        let power = &record.power;
        Self {
            unit: record.key.to_string(),
            backend: record.backend.label().to_string(),
            timestamp_ms: record.timestamp_ms,
            temperature: record.prompt.temperature,
            top_p: record.prompt.top_p,
            max_tokens: record.prompt.max_tokens,
            gpu_setting: record.prompt.gpu_setting.clone(),
            load_time_seconds: record.load_time_seconds,
            generation_time_seconds: record.generation_time_seconds,
            tokens_per_second: record.tokens_per_second,
            prompt_tokens: record.usage.prompt_tokens,
            completion_tokens: record.usage.completion_tokens,
            total_tokens: record.usage.total_tokens,
            cost: record.usage.cost,
            cpu_w_avg: power.cpu_watts.avg,
            cpu_w_max: power.cpu_watts.max,
            gpu_w_avg: power.gpu_watts.avg,
            gpu_w_max: power.gpu_watts.max,
            ane_w_avg: power.ane_watts.avg,
            ane_w_max: power.ane_watts.max,
            package_w_avg: power.package_avg_watts(),
            samplers: power.samplers.clone(),
            rss_hwm_bytes: record.memory.map(|m| m.process_rss_hwm_bytes),
            system_hwm_bytes: record.memory.map(|m| m.system_used_hwm_bytes),
            error: record.error.clone(),
            html_href: record.files.html.as_deref().map(|p| href(Path::new(p), report_dir)),
            log_href: record
                .files
                .powermetrics_log
                .as_deref()
                .map(|p| href(Path::new(p), report_dir)),
            json_href: href(json_path, report_dir),
        }
    }
}

/// Relative link when the artifact sits under the report directory,
/// `file://` URL otherwise.
fn href(path: &Path, report_dir: &Path) -> String {
    if let Ok(rel) = path.strip_prefix(report_dir) {
        return rel.to_string_lossy().replace('\\', "/");
    }
    if path.is_relative() && path.parent().map_or(true, |p| p.as_os_str().is_empty()) {
        return path.to_string_lossy().into_owned();
    }
    let absolute = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    format!("file://{}", absolute.to_string_lossy())
}

/// Every parsable record in `dir`, ordered by file name. The concurrency
/// summary and anything that is not a record are skipped.
pub fn load_records(dir: &Path) -> Result<Vec<(PathBuf, BenchmarkRunRecord)>> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
        .filter(|p| p.file_name().is_some_and(|n| n != SUMMARY_FILE))
        .collect();
    paths.sort();

    let mut records = Vec::with_capacity(paths.len());
    for path in paths {
        let parsed = std::fs::read_to_string(&path)
            .map_err(|e| e.to_string())
            .and_then(|text| {
                serde_json::from_str::<BenchmarkRunRecord>(&text).map_err(|e| e.to_string())
            });
        match parsed {
            Ok(record) => records.push((path, record)),
            Err(e) => debug!("Skipping {}: {}", path.display(), e),
        }
    }
    Ok(records)
}

const CSS: &str = r#"
body{font-family:system-ui,-apple-system,Segoe UI,Roboto,Ubuntu,'Helvetica Neue',Arial,sans-serif;line-height:1.35;margin:20px;color:#111}
h1{margin:0 0 8px 0}
.muted{color:#666}
table{border-collapse:collapse;width:100%;margin-top:12px}
th,td{border-bottom:1px solid #eee;padding:8px 10px;text-align:left}
th{cursor:pointer;user-select:none;background:#fafafa;position:sticky;top:0}
tr:hover{background:#fcfcfc}
.tag{display:inline-block;padding:2px 6px;border-radius:6px;background:#f1f5f9;border:1px solid #e2e8f0;font-size:12px;color:#0f172a}
.toolbar{display:flex;gap:12px;align-items:center;margin:8px 0 4px}
input[type="search"]{padding:6px 8px;border:1px solid #ddd;border-radius:6px;min-width:280px}
.small{font-size:12px}
.err{color:#b91c1c}
.nowrap{white-space:nowrap}
.charts{display:flex;flex-wrap:wrap;gap:24px;margin:16px 0}
canvas{border:1px solid #eee;border-radius:6px}
"#;

const SCRIPT: &str = r#"
let sortKey = 'unit';
let sortDir = 1;

function num(v){ return (v===null||v===undefined||v==='')?null:Number(v); }
function fixed(v){ return (v===null||v===undefined)?'-':Number(v).toFixed(2); }
function esc(s){ return String(s).replace(/[&<>"']/g, c => ({'&':'&amp;','<':'&lt;','>':'&gt;','"':'&quot;',"'":'&#39;'}[c])); }

function formatBytes(b){
  if (b==null) return '-';
  if (b < 1024) return b + ' B';
  const units=['KB','MB','GB','TB'];
  let u=-1; let v=b;
  do{ v/=1024; u++; }while(v>=1024&&u<units.length-1);
  return v.toFixed(2)+' '+units[u];
}

function link(href, label){
  return href ? `<a href="${esc(href)}" target="_blank">${label}</a>` : '<span class="muted">n/a</span>';
}

function visibleRows(){
  const q = document.querySelector('#search').value.toLowerCase();
  const rows = DATA.filter(r => !q || String(r.unit).toLowerCase().includes(q));
  rows.sort((a,b)=>{
    const av=a[sortKey], bv=b[sortKey];
    const an=num(av), bn=num(bv);
    if(an!=null && bn!=null && !isNaN(an) && !isNaN(bn)){ return (an-bn)*sortDir; }
    return String(av??'').localeCompare(String(bv??''))*sortDir;
  });
  return rows;
}

function render(){
  const tbody = document.querySelector('#tbl tbody');
  tbody.innerHTML='';
  const rows = visibleRows();
  for(const r of rows){
    const tr = document.createElement('tr');
    tr.innerHTML = `
      <td class="nowrap">${esc(r.unit)}</td>
      <td>${r.timestamp_ms ? new Date(r.timestamp_ms).toLocaleString() : '-'}</td>
      <td class="nowrap">${r.gpu_setting?`<span class="tag">gpu:${esc(r.gpu_setting)}</span>`:''} <span class="tag">T=${r.temperature ?? '-'}</span> <span class="tag">p=${r.top_p ?? '-'}</span></td>
      <td>${fixed(r.load_time_seconds)}</td>
      <td>${fixed(r.generation_time_seconds)}</td>
      <td>${fixed(r.tokens_per_second)}</td>
      <td>${r.total_tokens ?? '-'}</td>
      <td>${fixed(r.cpu_w_avg)}</td>
      <td>${fixed(r.gpu_w_avg)}</td>
      <td>${fixed(r.ane_w_avg)}</td>
      <td>${formatBytes(r.rss_hwm_bytes)}</td>
      <td>${r.cost==null ? '-' : '$'+Number(r.cost).toFixed(5)}</td>
      <td class="err">${r.error ? esc(r.error) : ''}</td>
      <td class="nowrap">${link(r.html_href,'HTML')} · ${link(r.log_href,'Log')} · ${link(r.json_href,'JSON')}</td>
    `;
    tbody.appendChild(tr);
  }
  document.querySelector('#count').textContent = rows.length;
  drawBars('#chart-tps', rows, 'tokens_per_second', '#2563eb');
  drawBars('#chart-power', rows, 'package_w_avg', '#dc2626');
}

function drawBars(sel, rows, key, color){
  const canvas = document.querySelector(sel);
  const ctx = canvas.getContext('2d');
  ctx.clearRect(0,0,canvas.width,canvas.height);
  const pts = rows.filter(r => num(r[key])!=null);
  ctx.fillStyle = '#666';
  ctx.font = '12px system-ui';
  if(!pts.length){ ctx.fillText('no data', 10, 20); return; }
  const max = Math.max(...pts.map(r => num(r[key]))) || 1;
  const rowH = Math.max(14, Math.floor((canvas.height-10)/pts.length));
  const labelW = 180;
  pts.forEach((r,i)=>{
    const v = num(r[key]);
    const y = 5 + i*rowH;
    const w = (canvas.width-labelW-60) * v / max;
    ctx.fillStyle = '#333';
    ctx.fillText(String(r.unit).slice(0,28), 4, y+rowH-4);
    ctx.fillStyle = color;
    ctx.fillRect(labelW, y+2, w, rowH-4);
    ctx.fillStyle = '#333';
    ctx.fillText(v.toFixed(2), labelW+w+4, y+rowH-4);
  });
}

function setupSort(){
  document.querySelectorAll('#tbl th').forEach(th=>{
    th.addEventListener('click',()=>{
      const key = th.dataset.key;
      if(!key) return;
      if(sortKey===key){ sortDir*=-1; } else { sortKey=key; sortDir=1; }
      render();
    });
  });
}

window.addEventListener('DOMContentLoaded',()=>{
  setupSort();
  document.querySelector('#search').addEventListener('input', render);
  render();
});
"#;

/// Renders the report page. Row data is embedded as JSON with `</`
/// escaped so it cannot close the script element.
pub fn build_report_html(title: &str, rows: &[ReportRow], prompt: Option<&str>) -> String {
    let data = serde_json::to_string(rows)
        .unwrap_or_else(|_| "[]".to_string())
        .replace("</", "<\\/");
    let title = escape_html(title);
    let prompt = escape_html(prompt.unwrap_or("Not available"));

    format!(
        r#"<!doctype html>
<html>
<head>
  <meta charset="utf-8">
  <meta name="viewport" content="width=device-width, initial-scale=1">
  <title>{title}</title>
  <style>{CSS}</style>
</head>
<body>
  <h1>{title}</h1>
  <div class="muted small">Generated from {count} result files.</div>
  <div class="toolbar">
    <input id="search" type="search" placeholder="Filter by model or level">
    <div class="small muted">Rows: <span id="count"></span></div>
  </div>
  <table id="tbl">
    <thead>
      <tr>
        <th data-key="unit">Unit</th>
        <th data-key="timestamp_ms">Timestamp</th>
        <th data-key="temperature">Settings</th>
        <th data-key="load_time_seconds">Load s</th>
        <th data-key="generation_time_seconds">Gen s</th>
        <th data-key="tokens_per_second">Tok/s</th>
        <th data-key="total_tokens">Tokens</th>
        <th data-key="cpu_w_avg">CPU W(avg)</th>
        <th data-key="gpu_w_avg">GPU W(avg)</th>
        <th data-key="ane_w_avg">ANE W(avg)</th>
        <th data-key="rss_hwm_bytes">RSS HWM</th>
        <th data-key="cost">Cost</th>
        <th data-key="error">Error</th>
        <th>Artifacts</th>
      </tr>
    </thead>
    <tbody></tbody>
  </table>

  <div class="charts">
    <div><h2>Tokens / s</h2><canvas id="chart-tps" width="640" height="{chart_height}"></canvas></div>
    <div><h2>Package power (W, avg)</h2><canvas id="chart-power" width="640" height="{chart_height}"></canvas></div>
  </div>

  <h2>Prompt</h2>
  <pre style="white-space:pre-wrap">{prompt}</pre>

  <script>
  const DATA = {data};
  {SCRIPT}
  </script>
</body>
</html>
"#,
        count = rows.len(),
        chart_height = (rows.len() * 22 + 20).max(120),
    )
}

/// Replaces `path` via a temp file in the same directory, so readers see
/// either the old report or the new one.
pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(contents.as_bytes())?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Builds the report for `dir` and writes it to `out`. Returns the number
/// of records included.
pub fn generate_report(dir: &Path, out: &Path, title: &str, prompt: Option<&str>) -> Result<usize> {
    let report_dir = out.parent().unwrap_or(dir);
    let records = load_records(dir)?;
    let rows: Vec<ReportRow> = records
        .iter()
        .map(|(path, record)| ReportRow::from_record(record, path, report_dir))
        .collect();

    // Fall back to the prompt the records were run with.
    let prompt = prompt.or_else(|| {
        records
            .iter()
            .map(|(_, r)| r.prompt.text.as_str())
            .find(|t| !t.is_empty())
    });

    write_atomic(out, &build_report_html(title, &rows, prompt))?;
    Ok(rows.len())
}

/// Serializes report regeneration for sweeps whose units finish
/// concurrently.
pub struct ReportWriter {
    dir: PathBuf,
    title: String,
    prompt: Option<String>,
    lock: Mutex<()>,
}

impl ReportWriter {
    pub fn new(dir: impl Into<PathBuf>, title: impl Into<String>, prompt: Option<String>) -> Self {
        Self {
            dir: dir.into(),
            title: title.into(),
            prompt,
            lock: Mutex::new(()),
        }
    }

    pub fn report_path(&self) -> PathBuf {
        self.dir.join(REPORT_FILE)
    }

    /// Regenerates the report. Failures are logged; a broken report never
    /// fails the sweep.
    pub async fn regenerate(&self) -> Option<PathBuf> {
        let _guard = self.lock.lock().await;
        let out = self.report_path();
        match generate_report(&self.dir, &out, &self.title, self.prompt.as_deref()) {
            Ok(count) => {
                info!(records = count, "Report updated: {}", out.display());
                Some(out)
            }
            Err(e) => {
                warn!("Failed to update report in {}: {}", self.dir.display(), e);
                None
            }
        }
    }
}
