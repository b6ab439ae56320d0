use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::error::{Error, Result};

/// Named ordered position inside a [`Pipeline`]
///
/// Phases are declared as constants and compared by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipelinePhase {
    name: &'static str,
}

impl PipelinePhase {
    /// Declare a phase
    pub const fn new(name: &'static str) -> Self {
        Self { name }
    }

    /// Get the phase name
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl fmt::Display for PipelinePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Interceptor registered into a pipeline phase
///
/// An interceptor receives the [`PipelineContext`] of the running execution.
/// Returning `Ok(())` continues with the next interceptor; the subject can be
/// changed in place, replaced with [`PipelineContext::proceed_with`], or the
/// whole execution stopped with [`PipelineContext::finish`].
#[async_trait]
pub trait Interceptor<S, C>: Send + Sync
where
    S: Send + 'static,
    C: Send + 'static,
{
    /// Process the current subject
    async fn intercept(&self, ctx: &mut PipelineContext<S, C>) -> Result<()>;

    /// Get the name of this interceptor
    fn name(&self) -> &str {
        "Unknown"
    }
}

type SharedInterceptor<S, C> = Arc<dyn Interceptor<S, C>>;

/// State of one pipeline execution, handed to every interceptor
pub struct PipelineContext<S, C> {
    interceptors: Arc<[SharedInterceptor<S, C>]>,
    index: usize,
    finished: bool,
    subject: S,
    context: C,
}

impl<S, C> PipelineContext<S, C>
where
    S: Send + 'static,
    C: Send + 'static,
{
    /// Get the current subject
    pub fn subject(&self) -> &S {
        &self.subject
    }

    /// Get mutable access to the current subject
    pub fn subject_mut(&mut self) -> &mut S {
        &mut self.subject
    }

    /// Replace the subject and keep going with the remaining interceptors
    pub fn set_subject(&mut self, subject: S) -> S {
        std::mem::replace(&mut self.subject, subject)
    }

    /// Get the execution context
    pub fn context(&self) -> &C {
        &self.context
    }

    /// Get mutable access to the execution context
    pub fn context_mut(&mut self) -> &mut C {
        &mut self.context
    }

    /// Stop the execution; the current subject becomes the result
    pub fn finish(&mut self) {
        self.finished = true;
    }

    /// Check whether [`PipelineContext::finish`] was called
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Run the remaining interceptors now and return to the caller afterwards
    ///
    /// This lets an interceptor wrap the rest of the chain, for example in a
    /// deadline. Interceptors that do not call it are followed by the rest of
    /// the chain once they return.
    pub fn proceed(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            while !self.finished && self.index < self.interceptors.len() {
                let interceptor = self.interceptors[self.index].clone();
                self.index += 1;
                interceptor.intercept(self).await?;
            }
            Ok(())
        })
    }

    /// Replace the subject, then run the remaining interceptors
    pub async fn proceed_with(&mut self, subject: S) -> Result<()> {
        self.subject = subject;
        self.proceed().await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PhaseRelation {
    Last,
    Before(PipelinePhase),
    After(PipelinePhase),
}

struct PhaseContent<S, C> {
    phase: PipelinePhase,
    relation: PhaseRelation,
    interceptors: Vec<SharedInterceptor<S, C>>,
}

/// Ordered interceptor chain with named phases
///
/// Phases are ordered at build time and frozen by the first execution.
/// Interceptors run in phase order, then in registration order within a
/// phase.
///
/// # Examples
///
/// ```rust
/// use rusttpx_core::pipeline::{Interceptor, Pipeline, PipelineContext, PipelinePhase};
/// use rusttpx_core::{async_trait, Result};
///
/// const DOUBLE: PipelinePhase = PipelinePhase::new("Double");
///
/// struct Doubler;
///
/// #[async_trait]
/// impl Interceptor<u32, ()> for Doubler {
///     async fn intercept(&self, ctx: &mut PipelineContext<u32, ()>) -> Result<()> {
///         *ctx.subject_mut() *= 2;
///         Ok(())
///     }
/// }
///
/// # tokio_test::block_on(async {
/// let mut pipeline = Pipeline::new(&[DOUBLE]).unwrap();
/// pipeline.intercept(DOUBLE, Doubler).unwrap();
/// assert_eq!(pipeline.execute((), 21).await.unwrap(), 42);
/// # });
/// ```
pub struct Pipeline<S, C> {
    phases: Vec<PhaseContent<S, C>>,
    executed: AtomicBool,
    flattened: OnceLock<Arc<[SharedInterceptor<S, C>]>>,
}

impl<S, C> Pipeline<S, C>
where
    S: Send + 'static,
    C: Send + 'static,
{
    /// Create a pipeline with the given phases in order
    pub fn new(phases: &[PipelinePhase]) -> Result<Self> {
        let mut pipeline = Self::empty();
        for phase in phases {
            pipeline.add_phase(*phase)?;
        }
        Ok(pipeline)
    }

    /// Create a pipeline without phases
    pub fn empty() -> Self {
        Self {
            phases: Vec::new(),
            executed: AtomicBool::new(false),
            flattened: OnceLock::new(),
        }
    }

    /// Append a phase after every existing phase
    pub fn add_phase(&mut self, phase: PipelinePhase) -> Result<()> {
        self.check_new_phase(phase)?;
        self.phases.push(PhaseContent {
            phase,
            relation: PhaseRelation::Last,
            interceptors: Vec::new(),
        });
        Ok(())
    }

    /// Insert a phase right before `reference`
    pub fn insert_phase_before(&mut self, reference: PipelinePhase, phase: PipelinePhase) -> Result<()> {
        self.check_new_phase(phase)?;
        let index = self.find_reference(reference)?;
        self.phases.insert(
            index,
            PhaseContent {
                phase,
                relation: PhaseRelation::Before(reference),
                interceptors: Vec::new(),
            },
        );
        Ok(())
    }

    /// Insert a phase after `reference` and after phases already inserted after it
    pub fn insert_phase_after(&mut self, reference: PipelinePhase, phase: PipelinePhase) -> Result<()> {
        self.check_new_phase(phase)?;
        let mut index = self.find_reference(reference)? + 1;
        while index < self.phases.len() && self.phases[index].relation == PhaseRelation::After(reference) {
            index += 1;
        }
        self.phases.insert(
            index,
            PhaseContent {
                phase,
                relation: PhaseRelation::After(reference),
                interceptors: Vec::new(),
            },
        );
        Ok(())
    }

    /// Register an interceptor at the end of `phase`
    pub fn intercept<I>(&mut self, phase: PipelinePhase, interceptor: I) -> Result<()>
    where
        I: Interceptor<S, C> + 'static,
    {
        self.intercept_shared(phase, Arc::new(interceptor))
    }

    /// Register an already shared interceptor at the end of `phase`
    pub fn intercept_shared(&mut self, phase: PipelinePhase, interceptor: Arc<dyn Interceptor<S, C>>) -> Result<()> {
        let content = self
            .phases
            .iter_mut()
            .find(|content| content.phase == phase)
            .ok_or_else(|| Error::config(format!("Phase {} was not registered for this pipeline", phase)))?;
        content.interceptors.push(interceptor);
        self.flattened = OnceLock::new();
        Ok(())
    }

    /// Copy phases and interceptors of `from` into this pipeline
    ///
    /// Missing phases are placed the way they are placed in `from`;
    /// interceptors are appended after the existing ones of the same phase.
    pub fn merge(&mut self, from: &Pipeline<S, C>) -> Result<()> {
        for content in &from.phases {
            if !self.has_phase(content.phase) {
                match content.relation {
                    PhaseRelation::Before(reference) if self.has_phase(reference) => {
                        self.insert_phase_before(reference, content.phase)?
                    }
                    PhaseRelation::After(reference) if self.has_phase(reference) => {
                        self.insert_phase_after(reference, content.phase)?
                    }
                    _ => self.add_phase(content.phase)?,
                }
            }
            for interceptor in &content.interceptors {
                self.intercept_shared(content.phase, interceptor.clone())?;
            }
        }
        Ok(())
    }

    /// Run every interceptor against `subject` and return the final subject
    pub async fn execute(&self, context: C, subject: S) -> Result<S> {
        self.execute_with_context(context, subject)
            .await
            .map(|(subject, _)| subject)
    }

    /// Run every interceptor and return the final subject and context
    pub async fn execute_with_context(&self, context: C, subject: S) -> Result<(S, C)> {
        self.executed.store(true, Ordering::Release);
        let interceptors = self.flattened.get_or_init(|| self.flatten()).clone();

        let mut ctx = PipelineContext {
            interceptors,
            index: 0,
            finished: false,
            subject,
            context,
        };
        ctx.proceed().await?;

        Ok((ctx.subject, ctx.context))
    }

    /// Check whether `phase` is registered
    pub fn has_phase(&self, phase: PipelinePhase) -> bool {
        self.phases.iter().any(|content| content.phase == phase)
    }

    /// Get the registered phases in execution order
    pub fn phases(&self) -> Vec<PipelinePhase> {
        self.phases.iter().map(|content| content.phase).collect()
    }

    /// Get the total number of registered interceptors
    pub fn interceptor_count(&self) -> usize {
        self.phases.iter().map(|content| content.interceptors.len()).sum()
    }

    /// Names of the interceptors registered in `phase`
    pub fn interceptor_names(&self, phase: PipelinePhase) -> Vec<String> {
        self.phases
            .iter()
            .filter(|content| content.phase == phase)
            .flat_map(|content| content.interceptors.iter().map(|i| i.name().to_string()))
            .collect()
    }

    /// Check if no interceptor is registered
    pub fn is_empty(&self) -> bool {
        self.interceptor_count() == 0
    }

    fn check_new_phase(&self, phase: PipelinePhase) -> Result<()> {
        if self.executed.load(Ordering::Acquire) {
            return Err(Error::config(format!(
                "Cannot add phase {} to a pipeline that has already been executed",
                phase
            )));
        }
        if self.has_phase(phase) {
            return Err(Error::config(format!("Phase {} is already registered", phase)));
        }
        Ok(())
    }

    fn find_reference(&self, reference: PipelinePhase) -> Result<usize> {
        self.phases
            .iter()
            .position(|content| content.phase == reference)
            .ok_or_else(|| Error::config(format!("Phase {} was not registered for this pipeline", reference)))
    }

    fn flatten(&self) -> Arc<[SharedInterceptor<S, C>]> {
        self.phases
            .iter()
            .flat_map(|content| content.interceptors.iter().cloned())
            .collect::<Vec<_>>()
            .into()
    }
}

impl<S, C> fmt::Debug for Pipeline<S, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_list();
        for content in &self.phases {
            list.entry(&format_args!("{} ({} interceptors)", content.phase, content.interceptors.len()));
        }
        list.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    const FIRST: PipelinePhase = PipelinePhase::new("First");
    const SECOND: PipelinePhase = PipelinePhase::new("Second");
    const THIRD: PipelinePhase = PipelinePhase::new("Third");

    type Log = Arc<Mutex<Vec<String>>>;

    struct Record {
        label: &'static str,
        log: Log,
    }

    #[async_trait]
    impl Interceptor<String, ()> for Record {
        async fn intercept(&self, ctx: &mut PipelineContext<String, ()>) -> Result<()> {
            self.log.lock().unwrap().push(self.label.to_string());
            ctx.subject_mut().push_str(self.label);
            Ok(())
        }

        fn name(&self) -> &str {
            self.label
        }
    }

    struct Finish;

    #[async_trait]
    impl Interceptor<String, ()> for Finish {
        async fn intercept(&self, ctx: &mut PipelineContext<String, ()>) -> Result<()> {
            ctx.finish();
            Ok(())
        }
    }

    struct Replace(&'static str);

    #[async_trait]
    impl Interceptor<String, ()> for Replace {
        async fn intercept(&self, ctx: &mut PipelineContext<String, ()>) -> Result<()> {
            ctx.proceed_with(self.0.to_string()).await
        }
    }

    struct Around {
        log: Log,
    }

    #[async_trait]
    impl Interceptor<String, ()> for Around {
        async fn intercept(&self, ctx: &mut PipelineContext<String, ()>) -> Result<()> {
            self.log.lock().unwrap().push("enter".into());
            ctx.proceed().await?;
            self.log.lock().unwrap().push(format!("exit:{}", ctx.subject()));
            Ok(())
        }
    }

    struct Fail;

    #[async_trait]
    impl Interceptor<String, ()> for Fail {
        async fn intercept(&self, _ctx: &mut PipelineContext<String, ()>) -> Result<()> {
            Err(Error::custom("boom"))
        }
    }

    struct Sleep(u64);

    #[async_trait]
    impl Interceptor<String, ()> for Sleep {
        async fn intercept(&self, ctx: &mut PipelineContext<String, ()>) -> Result<()> {
            tokio::time::sleep(Duration::from_millis(self.0)).await;
            ctx.subject_mut().push('z');
            Ok(())
        }
    }

    fn record(label: &'static str, log: &Log) -> Record {
        Record {
            label,
            log: log.clone(),
        }
    }

    #[tokio::test]
    async fn test_phase_order_wins_over_registration_order() {
        let log = Log::default();
        let mut pipeline = Pipeline::<String, ()>::new(&[FIRST, SECOND, THIRD]).unwrap();

        pipeline.intercept(THIRD, record("c", &log)).unwrap();
        pipeline.intercept(SECOND, record("b1", &log)).unwrap();
        pipeline.intercept(FIRST, record("a", &log)).unwrap();
        pipeline.intercept(SECOND, record("b2", &log)).unwrap();

        let result = pipeline.execute((), String::new()).await.unwrap();
        assert_eq!(result, "ab1b2c");
        assert_eq!(*log.lock().unwrap(), vec!["a", "b1", "b2", "c"]);
    }

    #[tokio::test]
    async fn test_relative_phase_insertion() {
        let log = Log::default();
        let mut pipeline = Pipeline::<String, ()>::new(&[FIRST, THIRD]).unwrap();
        let before_first = PipelinePhase::new("BeforeFirst");
        let after_first_1 = PipelinePhase::new("AfterFirst1");
        let after_first_2 = PipelinePhase::new("AfterFirst2");

        pipeline.insert_phase_after(FIRST, after_first_1).unwrap();
        pipeline.insert_phase_after(FIRST, after_first_2).unwrap();
        pipeline.insert_phase_before(FIRST, before_first).unwrap();
        pipeline.insert_phase_before(THIRD, SECOND).unwrap();

        assert_eq!(
            pipeline.phases(),
            vec![before_first, FIRST, after_first_1, after_first_2, SECOND, THIRD]
        );

        pipeline.intercept(THIRD, record("3", &log)).unwrap();
        pipeline.intercept(after_first_2, record("2", &log)).unwrap();
        pipeline.intercept(before_first, record("0", &log)).unwrap();
        pipeline.intercept(after_first_1, record("1", &log)).unwrap();

        assert_eq!(pipeline.execute((), String::new()).await.unwrap(), "0123");
    }

    #[tokio::test]
    async fn test_finish_stops_execution() {
        let log = Log::default();
        let mut pipeline = Pipeline::<String, ()>::new(&[FIRST, SECOND]).unwrap();
        pipeline.intercept(FIRST, record("a", &log)).unwrap();
        pipeline.intercept(FIRST, Finish).unwrap();
        pipeline.intercept(SECOND, record("b", &log)).unwrap();

        assert_eq!(pipeline.execute((), String::new()).await.unwrap(), "a");
        assert_eq!(*log.lock().unwrap(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_proceed_with_replaces_subject() {
        let log = Log::default();
        let mut pipeline = Pipeline::<String, ()>::new(&[FIRST, SECOND]).unwrap();
        pipeline.intercept(FIRST, Replace("new")).unwrap();
        pipeline.intercept(SECOND, record("!", &log)).unwrap();

        assert_eq!(pipeline.execute((), "old".into()).await.unwrap(), "new!");
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_explicit_proceed_wraps_the_rest_of_the_chain() {
        let log = Log::default();
        let mut pipeline = Pipeline::<String, ()>::new(&[FIRST, SECOND]).unwrap();
        pipeline.intercept(FIRST, Around { log: log.clone() }).unwrap();
        pipeline.intercept(SECOND, record("x", &log)).unwrap();

        assert_eq!(pipeline.execute((), String::new()).await.unwrap(), "x");
        assert_eq!(*log.lock().unwrap(), vec!["enter", "x", "exit:x"]);
    }

    #[tokio::test]
    async fn test_error_aborts_chain() {
        let log = Log::default();
        let mut pipeline = Pipeline::<String, ()>::new(&[FIRST, SECOND]).unwrap();
        pipeline.intercept(FIRST, Fail).unwrap();
        pipeline.intercept(SECOND, record("never", &log)).unwrap();

        let err = pipeline.execute((), String::new()).await.unwrap_err();
        assert_eq!(err.to_string(), "boom");
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_pipeline_returns_subject() {
        let pipeline = Pipeline::<String, ()>::new(&[FIRST]).unwrap();
        assert!(pipeline.is_empty());
        assert_eq!(pipeline.execute((), "same".into()).await.unwrap(), "same");
    }

    #[tokio::test]
    async fn test_phase_registration_errors() {
        let mut pipeline = Pipeline::<String, ()>::new(&[FIRST]).unwrap();

        assert!(pipeline.add_phase(FIRST).unwrap_err().is_config());
        assert!(pipeline.insert_phase_after(SECOND, THIRD).unwrap_err().is_config());
        assert!(pipeline.intercept(SECOND, Finish).unwrap_err().is_config());

        pipeline.execute((), String::new()).await.unwrap();
        assert!(pipeline.add_phase(SECOND).unwrap_err().is_config());

        // Interceptors can still be registered into existing phases.
        pipeline.intercept(FIRST, Finish).unwrap();
    }

    #[tokio::test]
    async fn test_merge_empty_pipeline_is_a_no_op() {
        let log = Log::default();
        let mut target = Pipeline::<String, ()>::new(&[FIRST, SECOND]).unwrap();
        target.intercept(SECOND, record("b", &log)).unwrap();

        let empty = Pipeline::<String, ()>::new(&[FIRST, SECOND]).unwrap();
        target.merge(&empty).unwrap();
        target.merge(&Pipeline::empty()).unwrap();

        assert_eq!(target.phases(), vec![FIRST, SECOND]);
        assert_eq!(target.interceptor_count(), 1);
        assert_eq!(target.execute((), String::new()).await.unwrap(), "b");
    }

    #[tokio::test]
    async fn test_merge_preserves_relative_order() {
        let log = Log::default();
        let mut target = Pipeline::<String, ()>::new(&[FIRST, THIRD]).unwrap();
        target.intercept(FIRST, record("a1", &log)).unwrap();

        let mut other = Pipeline::<String, ()>::new(&[FIRST, THIRD]).unwrap();
        other.insert_phase_before(THIRD, SECOND).unwrap();
        other.intercept(FIRST, record("a2", &log)).unwrap();
        other.intercept(SECOND, record("b", &log)).unwrap();
        other.intercept(THIRD, record("c", &log)).unwrap();

        target.merge(&other).unwrap();

        assert_eq!(target.phases(), vec![FIRST, SECOND, THIRD]);
        assert_eq!(target.interceptor_names(FIRST), vec!["a1", "a2"]);
        assert_eq!(target.execute((), String::new()).await.unwrap(), "a1a2bc");
    }

    #[tokio::test]
    async fn test_concurrent_executions_are_independent() {
        let mut pipeline = Pipeline::<String, ()>::new(&[FIRST]).unwrap();
        pipeline.intercept(FIRST, Sleep(30)).unwrap();
        let pipeline = Arc::new(pipeline);

        let slow = {
            let pipeline = pipeline.clone();
            tokio::spawn(async move { pipeline.execute((), "slow".into()).await })
        };
        let fast = pipeline.execute((), "fast".into()).await.unwrap();

        assert_eq!(fast, "fastz");
        assert_eq!(slow.await.unwrap().unwrap(), "slowz");
    }
}
