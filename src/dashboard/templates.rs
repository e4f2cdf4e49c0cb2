use crate::job::{Job, JobState, JobSummary};

fn layout(title: &str, content: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>{title} - queuectl</title>
    <style>
        * {{ box-sizing: border-box; margin: 0; padding: 0; }}
        body {{ font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif; background: #f5f5f5; color: #333; line-height: 1.6; }}
        .container {{ max-width: 1200px; margin: 0 auto; padding: 20px; }}
        header {{ background: #2563eb; color: white; padding: 20px; margin-bottom: 20px; }}
        header h1 {{ font-size: 1.5rem; }}
        nav {{ background: white; padding: 10px 20px; margin-bottom: 20px; border-radius: 8px; box-shadow: 0 1px 3px rgba(0,0,0,0.1); }}
        nav a {{ color: #2563eb; text-decoration: none; margin-right: 20px; padding: 8px 16px; border-radius: 4px; }}
        nav a:hover {{ background: #eff6ff; }}
        .stats {{ display: grid; grid-template-columns: repeat(auto-fit, minmax(150px, 1fr)); gap: 20px; margin-bottom: 30px; }}
        .stat-card {{ background: white; padding: 20px; border-radius: 8px; box-shadow: 0 1px 3px rgba(0,0,0,0.1); text-align: center; }}
        .stat-card h3 {{ font-size: 2rem; color: #2563eb; }}
        .stat-card p {{ color: #666; text-transform: uppercase; font-size: 0.8rem; }}
        .card {{ background: white; border-radius: 8px; box-shadow: 0 1px 3px rgba(0,0,0,0.1); overflow: hidden; }}
        .card-header {{ background: #f8fafc; padding: 15px 20px; border-bottom: 1px solid #e5e7eb; font-weight: 600; }}
        table {{ width: 100%; border-collapse: collapse; }}
        th, td {{ padding: 12px 20px; text-align: left; border-bottom: 1px solid #e5e7eb; }}
        th {{ background: #f8fafc; font-weight: 600; color: #666; font-size: 0.85rem; text-transform: uppercase; }}
        .badge {{ display: inline-block; padding: 4px 12px; border-radius: 20px; font-size: 0.75rem; font-weight: 600; }}
        .badge-pending {{ background: #dbeafe; color: #1d4ed8; }}
        .badge-processing {{ background: #fef3c7; color: #d97706; }}
        .badge-completed {{ background: #d1fae5; color: #059669; }}
        .badge-failed {{ background: #fee2e2; color: #dc2626; }}
        .badge-dead {{ background: #e5e7eb; color: #374151; }}
        .btn {{ display: inline-block; padding: 4px 8px; border: none; border-radius: 4px; font-size: 0.75rem; cursor: pointer; background: #2563eb; color: white; }}
        .mono {{ font-family: monospace; font-size: 0.85rem; }}
        .empty-state {{ text-align: center; padding: 40px; color: #666; }}
    </style>
</head>
<body>
    <header><div class="container"><h1>queuectl</h1></div></header>
    <div class="container">
        <nav>
            <a href="/">Overview</a>
            <a href="/jobs/pending">Pending</a>
            <a href="/jobs/processing">Processing</a>
            <a href="/jobs/completed">Completed</a>
            <a href="/jobs/failed">Failed</a>
            <a href="/jobs/dead">Dead</a>
        </nav>
        {content}
    </div>
</body>
</html>"#
    )
}

pub fn render_overview(summary: &JobSummary) -> String {
    let cards: String = JobState::ALL
        .iter()
        .map(|state| {
            format!(
                r#"<div class="stat-card"><h3>{}</h3><p>{}</p></div>"#,
                summary.count(*state),
                state
            )
        })
        .chain(std::iter::once(format!(
            r#"<div class="stat-card"><h3>{}</h3><p>total</p></div>"#,
            summary.total
        )))
        .collect();

    layout("Overview", &format!(r#"<div class="stats">{cards}</div>"#))
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

pub fn render_jobs(state: JobState, jobs: &[Job]) -> String {
    let rows = if jobs.is_empty() {
        r#"<tr><td colspan="6" class="empty-state">No jobs found</td></tr>"#.to_string()
    } else {
        jobs.iter()
            .map(|job| {
                let actions = if job.state == JobState::Dead {
                    format!(
                        r#"<form style="display:inline" method="post" action="/jobs/{}/retry"><button class="btn">Retry</button></form>"#,
                        html_escape(&job.id.0)
                    )
                } else {
                    String::new()
                };
                format!(
                    r#"<tr><td class="mono">{}</td><td class="mono">{}</td><td><span class="badge badge-{}">{}</span></td><td>{}/{}</td><td>{}</td><td>{}</td></tr>"#,
                    html_escape(&job.id.0),
                    html_escape(&job.command),
                    job.state,
                    job.state,
                    job.attempts,
                    job.max_retries,
                    job.updated_at.format("%Y-%m-%d %H:%M:%S"),
                    actions
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    };

    let content = format!(
        r#"<div class="card"><div class="card-header">{state} jobs</div>
        <table><thead><tr><th>ID</th><th>Command</th><th>State</th><th>Attempts</th><th>Updated</th><th>Actions</th></tr></thead>
        <tbody>{rows}</tbody></table></div>"#
    );
    layout(state.as_str(), &content)
}

pub fn render_message(message: &str) -> String {
    layout(
        "Error",
        &format!(r#"<div class="card"><div class="empty-state">{}</div></div>"#, html_escape(message)),
    )
}
