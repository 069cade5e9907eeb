use chrono::{DateTime, Utc};
use cron::Schedule;
use std::str::FromStr;

use cluster_core::{ClusterError, ClusterResult};

/// 最多统计的错过次数
const MAX_COUNTED_MISSES: usize = 1000;

/// 规范化CRON表达式
///
/// 5段的标准表达式补上秒字段 `0`，6段或7段原样保留。
pub fn normalize_cron_expression(cron_expr: &str) -> String {
    let fields: Vec<&str> = cron_expr.split_whitespace().collect();
    if fields.len() == 5 {
        format!("0 {}", fields.join(" "))
    } else {
        fields.join(" ")
    }
}

/// CRON表达式解析和调度工具
#[derive(Debug, Clone)]
pub struct CronScheduler {
    expression: String,
    schedule: Schedule,
}

impl CronScheduler {
    pub fn new(cron_expr: &str) -> ClusterResult<Self> {
        let expression = normalize_cron_expression(cron_expr);
        let schedule = Schedule::from_str(&expression).map_err(|e| ClusterError::InvalidCron {
            expr: cron_expr.to_string(),
            message: e.to_string(),
        })?;

        Ok(Self {
            expression,
            schedule,
        })
    }

    /// 规范化后的表达式
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// `from` 之后的下一次执行时间
    pub fn next_execution_time(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&from).next()
    }

    /// 获取从指定时间开始的多个执行时间
    pub fn upcoming_times(&self, from: DateTime<Utc>, count: usize) -> Vec<DateTime<Utc>> {
        self.schedule.after(&from).take(count).collect()
    }

    /// 计划时间 `scheduled` 之后、`now` 之前被跳过的执行次数
    pub fn missed_between(&self, scheduled: DateTime<Utc>, now: DateTime<Utc>) -> usize {
        self.schedule
            .after(&scheduled)
            .take_while(|t| *t <= now)
            .take(MAX_COUNTED_MISSES)
            .count()
    }

    /// 验证CRON表达式是否有效
    pub fn validate_cron_expression(cron_expr: &str) -> ClusterResult<()> {
        Self::new(cron_expr).map(|_| ())
    }

    /// 获取任务的执行频率描述
    pub fn get_frequency_description(&self) -> String {
        let upcoming = self.upcoming_times(Utc::now(), 2);
        if upcoming.len() >= 2 {
            let interval = upcoming[1] - upcoming[0];
            let seconds = interval.num_seconds();

            match seconds {
                s if s < 60 => format!("每{s}秒"),
                s if s < 3600 => format!("每{}分钟", s / 60),
                s if s < 86400 => format!("每{}小时", s / 3600),
                s if s < 604800 => format!("每{}天", s / 86400),
                s => format!("每{}周", s / 604800),
            }
        } else {
            "无法确定频率".to_string()
        }
    }
}
