//! 运行结果汇总.

use std::io::{self, Write};
use std::path::PathBuf;

use lc_berry::pipeline::CohortReport;

/// 队列运行最终结果.
pub struct CohortResult {
    report: CohortReport,
    csv_path: PathBuf,
}

/// 将汇总写进 `w` 中.
fn describe_into<W: Write>(r: &CohortResult, w: &mut W) -> io::Result<()> {
    const S4: &str = "    ";

    let report = &r.report;
    writeln!(w, "Subjects: {}", report.subjects)?;
    writeln!(w, "{S4}With records: {}", report.succeeded_subjects())?;
    writeln!(w, "{S4}Records: {}", report.records.len())?;
    writeln!(w, "{S4}Table: {}", r.csv_path.display())?;
    for rec in report.records.iter() {
        writeln!(
            w,
            "{S4}{} {:<8} cnr {:>8.4}  cr {:>8.4}",
            rec.subject_id, rec.contrast_name, rec.cnr, rec.cr
        )?;
    }
    if !report.failures.is_empty() {
        writeln!(w, "Failures: {}", report.failures.len())?;
        for f in report.failures.iter() {
            let what = f.contrast.as_deref().unwrap_or("*");
            writeln!(w, "{S4}{} {what}: {}", f.subject_id, f.reason)?;
        }
    }
    Ok(())
}

impl CohortResult {
    /// 包装队列报告.
    pub fn new(report: CohortReport, csv_path: PathBuf) -> Self {
        Self { report, csv_path }
    }

    /// 是否没有任何失败.
    pub fn is_complete(&self) -> bool {
        self.report.failures.is_empty()
    }

    /// 打印汇总.
    pub fn analyze(&self) {
        utils::sep();
        let mut buf = Vec::with_capacity(512);
        describe_into(self, &mut buf).unwrap();
        print!("{}", String::from_utf8_lossy(&buf));
        utils::sep();
    }
}
