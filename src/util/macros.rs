/// Run `$body` inside an info span named after the stage.
///
/// # Examples
/// ```rs
/// let dev = stage!("Attaching loop device" {
///     LoopDevice::attach(host, &image)?
/// });
/// ```
#[macro_export]
macro_rules! stage {
    ($s:literal $body:block) => {{
        let s = tracing::info_span!($s);
        {
            let _guard = s.enter();
            tracing::debug!("Entering stage");
            $body
        }
    }};
}
