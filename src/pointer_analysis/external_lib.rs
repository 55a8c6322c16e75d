//! Pointer effects of library functions whose bodies are not available.

use std::collections::{HashMap, HashSet};

use once_cell::sync::Lazy;
use regex::Regex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExternalKind {
    /// Returns a fresh object.
    Malloc,
    /// Returns a fresh object unless arg0 is null.
    Realloc,
    /// Copies `*arg1` into `*arg0`, returns arg0.
    Memcpy,
    RetArg0,
    /// Stores arg1 through arg0 (`strtol(s, &end, ..)`).
    Cast,
    /// No pointer effect.
    Normal,
}

const NORMAL: &[&str] = &[
    "log", "log10", "exp", "exp2", "exp10", "strcmp", "strncmp", "strncasecmp", "atoi", "atof",
    "atol", "atoll", "remove", "unlink", "rename", "memcmp", "free", "execl", "execlp", "execle",
    "execv", "execvp", "chmod", "puts", "write", "open", "create", "truncate", "chdir", "mkdir",
    "rmdir", "read", "pipe", "wait", "time", "stat", "fstat", "lstat", "fopen", "fopen64",
    "fdopen", "open64", "fflush", "feof", "fileno", "clearerr", "rewind", "ftell", "ferror",
    "fgetc", "_IO_getc", "fwrite", "fread", "fgets", "ungetc", "fputc", "fputs", "putc",
    "_IO_putc", "fseek", "fgetpos", "fsetpos", "printf", "fprintf", "sprintf", "vprintf",
    "vfprintf", "vsprintf", "scanf", "fscanf", "sscanf", "error", "__assert_fail", "modf",
    "putchar", "isalnum", "isalpha", "isascii", "isatty", "isblank", "iscntrl", "isdigit",
    "isgraph", "islower", "isprint", "ispunct", "isspace", "isupper", "iswalnum", "iswalpha",
    "iswctype", "iswdigit", "iswlower", "iswspace", "iswprint", "iswupper", "sin", "cos", "sinf",
    "cosf", "asin", "acos", "tan", "atan", "fabs", "pow", "floor", "ceil", "sqrt", "sqrtf",
    "hypot", "random", "tolower", "toupper", "towlower", "towupper", "system", "clock", "exit",
    "abort", "gettimeofday", "settimeofday", "sleep", "ctime", "strspn", "strcspn", "localtime",
    "strftime", "qsort", "popen", "pclose", "rand", "rand_r", "srand", "seed48", "drand48",
    "lrand48", "srand48", "__isoc99_sscanf", "__isoc99_fscanf", "fclose", "close", "perror",
    "strerror", "__errno_location", "__ctype_b_loc", "abs", "difftime", "setbuf", "_ZdlPv",
    "strlen", "strcasecmp", "_ZdaPv", "fesetround", "fegetround", "fetestexcept",
    "feraiseexcept", "feclearexcept", "llvm.stackrestore", "llvm.stacksave", "memset", "info",
    "llvm.va_end", "llvm.va_start", "getuid", "getopt_long", "getpwnam", "getgrgid", "getpid",
    "getpwuid", "snprintf", "htons", "ntohs", "tcsetpgrp", "tcsetattr", "killpg", "setpgid",
    "getrlimit", "setrlimit", "getgroups", "setegid", "seteuid", "setregid", "setreuid",
    "getgrouplist", "setgroups", "initgroups", "getegid", "setgid", "setuid", "sigwait", "setsid",
    "fork", "pthread_mutex_init", "pthread_mutex_lock", "pthread_mutex_unlock",
    "pthread_mutex_destroy", "pthread_attr_init", "pthread_attr_setscope",
    "pthread_attr_setstacksize", "pthread_attr_setdetachstate", "pthread_create",
    "pthread_attr_destroy", "pthread_cond_init", "pthread_cond_wait", "pthread_cond_signal",
    "pthread_cond_broadcast", "pthread_cond_destroy", "pthread_setcancelstate",
    "pthread_setcanceltype", "pthread_sigmask", "pthread_cond_timedwait", "pthread_join",
    "pthread_kill", "pthread_self", "pthread_exit", "pthread_cancel", "pthread_atfork", "waitpid",
    "usleep", "setenv", "atexit", "sigaction", "sysconf", "_exit", "access", "ioctl", "getlogin",
    "ntohl", "poll", "htonl", "recv", "prctl", "getopt", "chown", "getpriority", "setpriority",
    "kill", "signal", "dup2", "fchown", "tcgetattr", "tcgetpgrp", "getpgrp", "gethostname",
    "getppid", "getpgid", "getgid", "getsid", "div", "accept", "inet_ntop", "sigemptyset",
    "sigaddset", "socket", "connect", "select", "getchar", "strcasestr", "index", "inet_pton",
    "creat", "fsync", "link", "vsnprintf", "setsockopt", "listen", "bind", "getsockname",
    "openlog", "syslog", "closelog", "regcomp", "regexec", "dlsym", "dlopen", "dlclose",
    "dlerror", "pathconf", "opendir", "readdir", "closedir", "inet_addr", "unsetenv", "putenv",
    "fcntl", "geteuid", "send", "getsockopt", "getpeername", "hstrerror", "getpwuid_r",
    "getpwnam_r", "bsearch", "getgrnam_r", "getgrgid_r", "setgrent", "getgrent_r", "endgrent",
    "gethostbyname", "__h_errno_location", "gethostbyaddr", "get_current_dir_name", "asctime",
    "asctime_r", "ctime_r", "gmtime", "gmtime_r", "localtime_r", "mktime", "strsep", "regfree",
    "memchr", "sched_getaffinity", "readdir_r", "inet_nsap_addr", "dirname", "glob", "globfree",
    "dup", "setpwent", "getpwent_r", "endpwent", "setpgrp", "execve", "strsignal", "cfmakeraw",
    "wait4", "wait3", "login_tty", "faccessat", "setresuid", "openpty", "shutdown", "umask",
    "ptrace", "lseek", "rindex", "mount", "umount", "flock", "mlockall", "uname", "fchmod",
    "utime", "statvfs", "sysinfo", "__xstat64", "__lxstat64",
];

const MALLOC: &[&str] = &[
    "malloc",
    "valloc",
    "calloc",
    "strdup",
    "strndup",
    "getenv",
    "memalign",
    "posix_memalign",
];

const REALLOC: &[&str] = &["realloc", "strtok", "strtok_r"];

const MEMCPY: &[&str] = &["memcpy", "memccpy", "memmove", "bcopy", "llvm.va_copy"];

const RET_ARG0: &[&str] = &[
    "fgets", "gets", "stpcpy", "strcat", "strchr", "strcpy", "strerror_r", "strncat", "strncpy",
    "strpbrk", "strptime", "strrchr", "strstr", "getcwd",
];

const CAST: &[&str] = &[
    "strtod", "strtof", "strtol", "strtold", "strtoll", "strtoul", "strtoull",
];

const DEBUG: &[&str] = &[
    "error", "info", "verbose", "debug", "debug2", "debug3", "debug4", "debug5", "schedlog",
    "log_msg", "log_oom",
];

/// Later tables win: `strdup` and `fgets` are listed as normal first.
static EXTERNAL_FUNCTIONS: Lazy<HashMap<&'static str, ExternalKind>> = Lazy::new(|| {
    let mut m = HashMap::new();
    for (names, kind) in [
        (NORMAL, ExternalKind::Normal),
        (MALLOC, ExternalKind::Malloc),
        (REALLOC, ExternalKind::Realloc),
        (MEMCPY, ExternalKind::Memcpy),
        (RET_ARG0, ExternalKind::RetArg0),
        (CAST, ExternalKind::Cast),
    ] {
        for name in names {
            m.insert(*name, kind);
        }
    }
    m
});

/// Intrinsic families whose suffix encodes operand types.
static INTRINSIC_REGEX: Lazy<Vec<(Regex, ExternalKind)>> = Lazy::new(|| {
    vec![
        (
            Regex::new(r"^llvm\.(memcpy|memmove)\.").unwrap(),
            ExternalKind::Memcpy,
        ),
        (
            Regex::new(r"^llvm\.(memset|lifetime\.(start|end)|dbg|bswap|ctlz|cttz|ctpop)(\.|$)")
                .unwrap(),
            ExternalKind::Normal,
        ),
    ]
});

static DEBUG_FUNCTIONS: Lazy<HashSet<&'static str>> =
    Lazy::new(|| DEBUG.iter().copied().collect());

/// `None` for functions the effect model does not know.
pub fn classify(name: &str) -> Option<ExternalKind> {
    if let Some(kind) = EXTERNAL_FUNCTIONS.get(name) {
        return Some(*kind);
    }
    INTRINSIC_REGEX
        .iter()
        .find(|(regex, _)| regex.is_match(name))
        .map(|(_, kind)| *kind)
}

/// Logging helpers, skipped by constraint collection and the call graph.
pub fn is_debug_function(name: &str) -> bool {
    DEBUG_FUNCTIONS.contains(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        assert_eq!(classify("malloc"), Some(ExternalKind::Malloc));
        assert_eq!(classify("strdup"), Some(ExternalKind::Malloc));
        assert_eq!(classify("fgets"), Some(ExternalKind::RetArg0));
        assert_eq!(classify("free"), Some(ExternalKind::Normal));
        assert_eq!(classify("realloc"), Some(ExternalKind::Realloc));
        assert_eq!(classify("strtol"), Some(ExternalKind::Cast));
        assert_eq!(classify("frobnicate"), None);
    }

    #[test]
    fn test_intrinsic_families() {
        assert_eq!(
            classify("llvm.memcpy.p0i8.p0i8.i64"),
            Some(ExternalKind::Memcpy)
        );
        assert_eq!(classify("llvm.memmove.p0.p0.i64"), Some(ExternalKind::Memcpy));
        assert_eq!(classify("llvm.memset.p0.i64"), Some(ExternalKind::Normal));
        assert_eq!(classify("llvm.lifetime.start.p0"), Some(ExternalKind::Normal));
        assert_eq!(classify("llvm.dbg.value"), Some(ExternalKind::Normal));
        assert_eq!(classify("llvm.memcpyish"), None);
    }

    #[test]
    fn test_debug_functions() {
        assert!(is_debug_function("debug3"));
        assert!(is_debug_function("log_oom"));
        assert!(!is_debug_function("malloc"));
    }
}
