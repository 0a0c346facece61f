//! 进度上报
//!
//! 长时间操作通过 [`ProgressSink`] 上报百分比，并在循环中调用 `tick()`
//! 让服务端排空多余的连接请求。

/// 进度接收端
pub trait ProgressSink {
    /// 上报进度百分比（0-100）
    fn progress(&mut self, percent: u8);

    /// 协作让出点，长时间循环中周期性调用
    fn tick(&mut self) {}
}

/// 丢弃所有进度
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn progress(&mut self, _percent: u8) {}
}

/// 记录所有进度（测试和诊断用）
impl ProgressSink for Vec<u8> {
    fn progress(&mut self, percent: u8) {
        self.push(percent);
    }
}

impl<S: ProgressSink + ?Sized> ProgressSink for &mut S {
    fn progress(&mut self, percent: u8) {
        (**self).progress(percent);
    }

    fn tick(&mut self) {
        (**self).tick();
    }
}

/// 进度去重：只在百分比变化时上报，结束时保证上报一次 100
pub struct ProgressTracker<'a, S: ProgressSink + ?Sized> {
    sink: &'a mut S,
    last: Option<u8>,
}

impl<'a, S: ProgressSink + ?Sized> ProgressTracker<'a, S> {
    pub fn new(sink: &'a mut S) -> Self {
        Self { sink, last: None }
    }

    /// 由已完成量和总量计算百分比并上报
    pub fn update_ratio(&mut self, done: u64, total: u64) {
        let percent = if total == 0 {
            100
        } else {
            (done.saturating_mul(100) / total).min(100) as u8
        };
        self.update(percent);
    }

    pub fn update(&mut self, percent: u8) {
        let percent = percent.min(100);
        if self.last != Some(percent) {
            self.last = Some(percent);
            self.sink.progress(percent);
        }
    }

    pub fn tick(&mut self) {
        self.sink.tick();
    }

    /// 操作完成：若最后一次不是 100 则补发
    pub fn finish(&mut self) {
        self.update(100);
    }

    pub fn last(&self) -> Option<u8> {
        self.last
    }
}
